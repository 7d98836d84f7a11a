//! Peripheral access and board state.
//!
//! The session core never touches pins directly. It works through a
//! [`Board`], which owns a [`PeripheralDriver`] plus the small amount of
//! signal conditioning the firmware performs:
//! - Button debouncing with press-edge latching (inputs are active-low)
//! - Moving-average smoothing of the potentiometer ADC
//! - Optional potentiometer-follow mode for servo 0

use esplink_protocol::{
    encode_status, ButtonState, CommandKind, LedState, MessageType, PotentiometerReading,
    ServoAngle, ServoChannel, StatusMessage,
};
use serde::{Deserialize, Serialize};

/// Full-scale value of the 12-bit ADC.
pub const ADC_MAX: u16 = 4095;

/// ADC reference voltage.
pub const ADC_REFERENCE_VOLTS: f32 = 3.3;

pub const SERVO_MAX_ANGLE: u8 = 180;

/// Position servos are driven to on start-up.
pub const SERVO_CENTER: u8 = 90;

/// Largest potentiometer smoothing window.
pub const MAX_ANALOG_SAMPLES: usize = 1024;

/// Synchronous access to the raw hardware.
///
/// Implementations are expected to be cheap and non-blocking.
pub trait PeripheralDriver {
    /// Read the level of a digital pin (`true` = high).
    fn read_digital(&mut self, pin: u8) -> bool;

    /// Drive a digital output pin.
    fn write_digital(&mut self, pin: u8, high: bool);

    /// Read a raw ADC sample (0-4095).
    fn read_analog(&mut self, pin: u8) -> u16;

    /// Move a servo channel to `angle` degrees.
    fn write_servo(&mut self, channel: usize, angle: u8);
}

/// Integer range mapping with truncation, as done by the firmware.
pub fn map_range(value: i64, in_min: i64, in_max: i64, out_min: i64, out_max: i64) -> i64 {
    if in_max == in_min {
        return out_min;
    }
    (value - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

// ============================================================================
// Board layout
// ============================================================================

/// Firmware variant. Selects the accepted command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardProfile {
    /// Five LEDs, five buttons, a potentiometer.
    #[default]
    LedPanel,
    /// One servo driven by `set_servo {angle}`.
    SingleServo,
    /// Several servos driven by `set_servo {servo_index, angle}`.
    MultiServo,
}

impl BoardProfile {
    /// Whether an authenticated session may issue commands of `kind`.
    pub fn accepts(&self, kind: CommandKind) -> bool {
        match kind {
            CommandKind::Auth | CommandKind::GetStatus | CommandKind::Ping => true,
            CommandKind::SetOutput | CommandKind::SetAllOutputs => {
                *self == BoardProfile::LedPanel
            }
            CommandKind::SetServo => *self != BoardProfile::LedPanel,
            CommandKind::Unknown => false,
        }
    }
}

/// Potentiometer-follow settings for servo 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotFollow {
    /// Minimum angle change (exclusive) before the servo moves.
    pub deadband: u8,
    /// Minimum time between servo moves.
    pub interval_ms: u64,
}

impl Default for PotFollow {
    fn default() -> Self {
        Self {
            deadband: 2,
            interval_ms: 50,
        }
    }
}

/// Pin assignment and conditioning parameters for a board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardLayout {
    pub profile: BoardProfile,
    pub led_pins: Vec<u8>,
    pub button_pins: Vec<u8>,
    pub potentiometer_pin: u8,
    pub servo_pins: Vec<u8>,
    pub debounce_ms: u64,
    pub analog_samples: usize,
    pub pot_follow: Option<PotFollow>,
}

impl Default for BoardLayout {
    fn default() -> Self {
        Self::led_panel()
    }
}

impl BoardLayout {
    /// LED/button/potentiometer panel. The on-board servo follows the pot.
    pub fn led_panel() -> Self {
        Self {
            profile: BoardProfile::LedPanel,
            led_pins: vec![2, 4, 5, 18, 19],
            button_pins: vec![12, 13, 14, 15, 16],
            potentiometer_pin: 34,
            servo_pins: vec![23],
            debounce_ms: 50,
            analog_samples: 10,
            pot_follow: Some(PotFollow::default()),
        }
    }

    /// Single-servo arm.
    pub fn single_servo() -> Self {
        Self {
            profile: BoardProfile::SingleServo,
            led_pins: Vec::new(),
            button_pins: Vec::new(),
            servo_pins: vec![23],
            pot_follow: None,
            ..Self::led_panel()
        }
    }

    /// Four-servo arm.
    pub fn multi_servo() -> Self {
        Self {
            profile: BoardProfile::MultiServo,
            servo_pins: vec![23, 22, 21, 19],
            ..Self::single_servo()
        }
    }

    pub fn for_profile(profile: BoardProfile) -> Self {
        match profile {
            BoardProfile::LedPanel => Self::led_panel(),
            BoardProfile::SingleServo => Self::single_servo(),
            BoardProfile::MultiServo => Self::multi_servo(),
        }
    }

    /// Upper bound on the encoded length of a status line for this layout.
    pub fn max_status_len(&self) -> usize {
        let angles = vec![SERVO_MAX_ANGLE; self.servo_pins.len()];
        let (servo, servos) = servo_fields(&angles);
        let status = StatusMessage {
            message_type: MessageType::Status,
            timestamp: u64::MAX,
            leds: self
                .led_pins
                .iter()
                .map(|_| LedState {
                    id: u8::MAX,
                    state: false,
                })
                .collect(),
            buttons: self
                .button_pins
                .iter()
                .map(|_| ButtonState {
                    id: u8::MAX,
                    pressed: false,
                })
                .collect(),
            potentiometer: PotentiometerReading {
                raw: ADC_MAX,
                voltage: 0.0,
                percent: 100,
            },
            servo,
            servos: servos
                .into_iter()
                .map(|channel| ServoChannel {
                    id: u8::MAX,
                    ..channel
                })
                .collect(),
        };

        match encode_status(&status) {
            Ok(line) => line.len() + VOLTAGE_SLACK,
            Err(_) => usize::MAX,
        }
    }
}

/// Extra bytes a real voltage may take over the "0.0" placeholder: up to
/// nine significant digits after "0.000".
const VOLTAGE_SLACK: usize = 12;

/// Status shape: one servo reports `servo`, several report `servos`.
fn servo_fields(angles: &[u8]) -> (Option<ServoAngle>, Vec<ServoChannel>) {
    match angles {
        [] => (None, Vec::new()),
        [angle] => (Some(ServoAngle { angle: *angle }), Vec::new()),
        angles => (
            None,
            angles
                .iter()
                .enumerate()
                .map(|(i, &angle)| ServoChannel { id: i as u8, angle })
                .collect(),
        ),
    }
}

// ============================================================================
// Signal conditioning
// ============================================================================

/// Debounced active-low button with a latched press edge.
#[derive(Debug, Clone, Default)]
struct Debouncer {
    stable: bool,
    last_reading: bool,
    last_change_ms: u64,
    pressed: bool,
}

impl Debouncer {
    /// Feed one reading (`true` = pressed). Returns true on a new press edge.
    fn update(&mut self, reading: bool, now_ms: u64, delay_ms: u64) -> bool {
        if reading != self.last_reading {
            self.last_change_ms = now_ms;
        }
        self.last_reading = reading;

        if now_ms.saturating_sub(self.last_change_ms) > delay_ms && reading != self.stable {
            let was_pressed = self.stable;
            self.stable = reading;
            if !was_pressed && reading {
                self.pressed = true;
                return true;
            }
        }
        false
    }

    fn take_press(&mut self) -> bool {
        std::mem::take(&mut self.pressed)
    }
}

/// Fixed-window moving average.
#[derive(Debug, Clone)]
struct MovingAverage {
    samples: Vec<u16>,
    index: usize,
    total: u32,
}

impl MovingAverage {
    fn new(window: usize) -> Self {
        Self {
            samples: vec![0; window.clamp(1, MAX_ANALOG_SAMPLES)],
            index: 0,
            total: 0,
        }
    }

    fn push(&mut self, sample: u16) {
        self.total -= u32::from(self.samples[self.index]);
        self.samples[self.index] = sample;
        self.total += u32::from(sample);
        self.index = (self.index + 1) % self.samples.len();
    }

    fn average(&self) -> u16 {
        (self.total / self.samples.len() as u32) as u16
    }
}

// ============================================================================
// Board
// ============================================================================

/// Owned peripheral state, threaded by reference through the dispatcher and
/// broadcaster.
pub struct Board<D> {
    driver: D,
    layout: BoardLayout,
    buttons: Vec<Debouncer>,
    analog: MovingAverage,
    servo_angles: Vec<u8>,
    last_follow_angle: u8,
    last_follow_ms: u64,
}

impl<D: PeripheralDriver> Board<D> {
    /// Initialise the hardware: LEDs off, servos centred, ADC window primed.
    pub fn new(mut driver: D, layout: BoardLayout) -> Self {
        for &pin in &layout.led_pins {
            driver.write_digital(pin, false);
        }
        for channel in 0..layout.servo_pins.len() {
            driver.write_servo(channel, SERVO_CENTER);
        }

        let mut analog = MovingAverage::new(layout.analog_samples);
        for _ in 0..analog.samples.len() {
            analog.push(driver.read_analog(layout.potentiometer_pin).min(ADC_MAX));
        }

        Self {
            buttons: vec![Debouncer::default(); layout.button_pins.len()],
            servo_angles: vec![SERVO_CENTER; layout.servo_pins.len()],
            last_follow_angle: SERVO_CENTER,
            last_follow_ms: 0,
            analog,
            driver,
            layout,
        }
    }

    pub fn layout(&self) -> &BoardLayout {
        &self.layout
    }

    pub fn profile(&self) -> BoardProfile {
        self.layout.profile
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Sample inputs. Call once per control-loop tick.
    pub fn update(&mut self, now_ms: u64) {
        let delay = self.layout.debounce_ms;
        for (i, &pin) in self.layout.button_pins.iter().enumerate() {
            // Inputs use pull-ups, so a pressed button reads low.
            let reading = !self.driver.read_digital(pin);
            if self.buttons[i].update(reading, now_ms, delay) {
                tracing::debug!("Button {} pressed", i + 1);
            }
        }

        let sample = self
            .driver
            .read_analog(self.layout.potentiometer_pin)
            .min(ADC_MAX);
        self.analog.push(sample);

        self.follow_potentiometer(now_ms);
    }

    fn follow_potentiometer(&mut self, now_ms: u64) {
        let Some(follow) = self.layout.pot_follow else {
            return;
        };
        if self.servo_angles.is_empty()
            || now_ms.saturating_sub(self.last_follow_ms) < follow.interval_ms
        {
            return;
        }

        let target = map_range(
            i64::from(self.analog.average()),
            0,
            i64::from(ADC_MAX),
            0,
            i64::from(SERVO_MAX_ANGLE),
        ) as u8;

        if target.abs_diff(self.last_follow_angle) > follow.deadband {
            tracing::debug!(
                "Potentiometer servo update: {} -> {} degrees",
                self.last_follow_angle,
                target
            );
            self.set_servo(0, target);
            self.last_follow_angle = target;
            self.last_follow_ms = now_ms;
        }
    }

    // ------------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------------

    pub fn output_count(&self) -> usize {
        self.layout.led_pins.len()
    }

    /// Drive output `index` (0-based). Out-of-range indices are ignored.
    pub fn set_output(&mut self, index: usize, on: bool) {
        if let Some(&pin) = self.layout.led_pins.get(index) {
            self.driver.write_digital(pin, on);
        }
    }

    pub fn set_all_outputs(&mut self, on: bool) {
        for index in 0..self.output_count() {
            self.set_output(index, on);
        }
    }

    /// Current level of output `index`, read back from the pin.
    pub fn output_state(&mut self, index: usize) -> bool {
        match self.layout.led_pins.get(index) {
            Some(&pin) => self.driver.read_digital(pin),
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    pub fn input_count(&self) -> usize {
        self.layout.button_pins.len()
    }

    /// Debounced level of input `index`.
    pub fn input_held(&self, index: usize) -> bool {
        self.buttons.get(index).map_or(false, |b| b.stable)
    }

    /// Press edge of input `index`; reading it clears it.
    pub fn take_press(&mut self, index: usize) -> bool {
        self.buttons.get_mut(index).map_or(false, Debouncer::take_press)
    }

    /// Smoothed potentiometer reading.
    pub fn analog_reading(&self) -> PotentiometerReading {
        let raw = self.analog.average();
        PotentiometerReading {
            raw,
            voltage: f32::from(raw) * ADC_REFERENCE_VOLTS / f32::from(ADC_MAX),
            percent: map_range(i64::from(raw), 0, i64::from(ADC_MAX), 0, 100) as u8,
        }
    }

    // ------------------------------------------------------------------------
    // Servos
    // ------------------------------------------------------------------------

    pub fn servo_count(&self) -> usize {
        self.servo_angles.len()
    }

    pub fn servo_angle(&self, channel: usize) -> Option<u8> {
        self.servo_angles.get(channel).copied()
    }

    /// Move servo `channel`, clamping to 0-180. Unknown channels are ignored.
    pub fn set_servo(&mut self, channel: usize, angle: u8) {
        let angle = angle.min(SERVO_MAX_ANGLE);
        if let Some(current) = self.servo_angles.get_mut(channel) {
            *current = angle;
            self.driver.write_servo(channel, angle);
        }
    }

    // ------------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------------

    /// Assemble a status payload. Consumes pending press edges.
    pub fn snapshot(&mut self, timestamp: u64) -> StatusMessage {
        let leds = (0..self.output_count())
            .map(|i| LedState {
                id: (i + 1) as u8,
                state: self.output_state(i),
            })
            .collect();

        let buttons = (0..self.input_count())
            .map(|i| ButtonState {
                id: (i + 1) as u8,
                pressed: self.take_press(i),
            })
            .collect();

        let (servo, servos) = servo_fields(&self.servo_angles);

        StatusMessage {
            message_type: MessageType::Status,
            timestamp,
            leds,
            buttons,
            potentiometer: self.analog_reading(),
            servo,
            servos,
        }
    }
}
