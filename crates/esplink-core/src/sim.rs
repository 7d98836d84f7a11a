//! In-memory peripheral driver.
//!
//! Used by the Linux server binary (which has no real GPIO) and by tests.

use std::collections::HashMap;

use crate::peripheral::{PeripheralDriver, ADC_MAX};

/// Triangle-wave analog source.
#[derive(Debug, Clone, Copy)]
struct Sweep {
    step: u16,
    rising: bool,
}

/// Simulated pins.
///
/// Digital pins that were never written read high, as a floating input with
/// a pull-up would.
#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    levels: HashMap<u8, bool>,
    analog: HashMap<u8, u16>,
    servos: HashMap<usize, u8>,
    sweep: Option<Sweep>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self {
            levels: HashMap::new(),
            analog: HashMap::new(),
            servos: HashMap::new(),
            sweep: None,
        }
    }

    /// Make every analog pin sweep 0 → 4095 → 0 in increments of `step`
    /// per read.
    pub fn with_sweep(mut self, step: u16) -> Self {
        self.sweep = Some(Sweep {
            step: step.max(1),
            rising: true,
        });
        self
    }

    pub fn set_level(&mut self, pin: u8, high: bool) {
        self.levels.insert(pin, high);
    }

    pub fn level(&self, pin: u8) -> bool {
        self.levels.get(&pin).copied().unwrap_or(true)
    }

    /// Hold an active-low button down.
    pub fn press(&mut self, pin: u8) {
        self.set_level(pin, false);
    }

    pub fn release(&mut self, pin: u8) {
        self.set_level(pin, true);
    }

    pub fn set_analog(&mut self, pin: u8, value: u16) {
        self.analog.insert(pin, value.min(ADC_MAX));
    }

    /// Last angle written to a servo channel.
    pub fn servo(&self, channel: usize) -> Option<u8> {
        self.servos.get(&channel).copied()
    }
}

impl PeripheralDriver for SimulatedDriver {
    fn read_digital(&mut self, pin: u8) -> bool {
        self.level(pin)
    }

    fn write_digital(&mut self, pin: u8, high: bool) {
        self.set_level(pin, high);
    }

    fn read_analog(&mut self, pin: u8) -> u16 {
        let current = self.analog.get(&pin).copied().unwrap_or(0);
        if let Some(sweep) = self.sweep.as_mut() {
            let next = if sweep.rising {
                current.saturating_add(sweep.step).min(ADC_MAX)
            } else {
                current.saturating_sub(sweep.step)
            };
            if next == ADC_MAX || next == 0 {
                sweep.rising = !sweep.rising;
            }
            self.analog.insert(pin, next);
        }
        current
    }

    fn write_servo(&mut self, channel: usize, angle: u8) {
        self.servos.insert(channel, angle);
    }
}
