//! End-to-end tests against a real server on an ephemeral port.

use std::net::SocketAddr;
use std::time::Duration;

use esplink_core::{BoardProfile, DeviceSettings, SimulatedDriver};
use esplink_server::{DeviceServer, ServerConfig};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

async fn start(settings: DeviceSettings) -> (SocketAddr, JoinHandle<()>) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    };
    let server = DeviceServer::bind(config, &settings, SimulatedDriver::new())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });
    (addr, handle)
}

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, raw: &str) {
        self.send_bytes(raw.as_bytes()).await;
    }

    async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Next line, or `None` once the server closed the connection.
    async fn recv(&mut self) -> Option<Value> {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Next line that is not a status broadcast.
    async fn recv_response(&mut self) -> Value {
        loop {
            let value = self.recv().await.expect("connection closed");
            if value["type"] != "status" {
                return value;
            }
        }
    }

    async fn authenticate(&mut self) {
        let challenge = self.recv().await.unwrap();
        assert_eq!(challenge["status"], "auth_required");
        self.send(json!({"command": "auth", "password": "IoTDevice2024"}))
            .await;
        let resp = self.recv_response().await;
        assert_eq!(resp["status"], "success");
        assert_eq!(resp["message"], "Authenticated");
    }
}

#[tokio::test]
async fn test_challenge_on_connect() {
    let (addr, server) = start(DeviceSettings::default()).await;
    let mut client = TestClient::connect(addr).await;

    let challenge = client.recv().await.unwrap();
    assert_eq!(challenge["status"], "auth_required");
    assert_eq!(
        challenge["message"],
        r#"Send authentication: {"command":"auth","password":"your_password"}"#
    );
    assert!(challenge["timestamp"].is_u64());

    server.abort();
}

#[tokio::test]
async fn test_auth_and_led_control() {
    let (addr, server) = start(DeviceSettings::default()).await;
    let mut client = TestClient::connect(addr).await;
    client.authenticate().await;

    client
        .send(json!({"command": "set_led", "led": 1, "state": true}))
        .await;
    let resp = client.recv_response().await;
    assert_eq!(resp["status"], "success");
    assert_eq!(resp["message"], "LED 1 set to ON");

    client
        .send(json!({"command": "set_led", "led": 9, "state": true}))
        .await;
    let resp = client.recv_response().await;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["message"], "Invalid LED number (1-5)");

    client.send(json!({"command": "get_status"})).await;
    let status = loop {
        let value = client.recv().await.unwrap();
        if value["type"] == "status" && value["leds"][0]["state"] == true {
            break value;
        }
    };
    assert_eq!(status["leds"].as_array().unwrap().len(), 5);
    assert_eq!(status["leds"][1]["state"], false);

    server.abort();
}

#[tokio::test]
async fn test_commands_before_auth_are_rejected() {
    let (addr, server) = start(DeviceSettings::default()).await;
    let mut client = TestClient::connect(addr).await;
    client.recv().await.unwrap();

    client.send(json!({"command": "ping"})).await;
    let resp = client.recv().await.unwrap();
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["message"], "Authentication required");

    server.abort();
}

#[tokio::test]
async fn test_wrong_password_keeps_connection_open() {
    let (addr, server) = start(DeviceSettings::default()).await;
    let mut client = TestClient::connect(addr).await;
    client.recv().await.unwrap();

    client
        .send(json!({"command": "auth", "password": "letmein"}))
        .await;
    let resp = client.recv().await.unwrap();
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["message"], "Invalid password");

    // The same connection can still authenticate
    client
        .send(json!({"command": "auth", "password": "IoTDevice2024"}))
        .await;
    assert_eq!(client.recv_response().await["message"], "Authenticated");

    server.abort();
}

#[tokio::test]
async fn test_fragmented_and_pipelined_requests() {
    let (addr, server) = start(DeviceSettings::default()).await;
    let mut client = TestClient::connect(addr).await;
    client.authenticate().await;

    client.send_raw("{\"command\":\"pi").await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    client
        .send_raw("ng\"}\nnot json\n{\"command\":\"ping\"}\n")
        .await;

    assert_eq!(client.recv_response().await["message"], "pong");
    assert_eq!(client.recv_response().await["message"], "Invalid JSON");
    assert_eq!(client.recv_response().await["message"], "pong");

    server.abort();
}

#[tokio::test]
async fn test_oversized_and_non_utf8_lines_get_invalid_json() {
    let (addr, server) = start(DeviceSettings::default()).await;
    let mut client = TestClient::connect(addr).await;
    client.recv().await.unwrap();

    // Well-formed, but past the line limit.
    let padding = "x".repeat(1100);
    client
        .send(json!({"command": "auth", "password": "IoTDevice2024", "pad": padding}))
        .await;
    let resp = client.recv().await.unwrap();
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["message"], "Invalid JSON");

    client.send_bytes(b"{\"command\":\"p\xffng\"}\n").await;
    let resp = client.recv().await.unwrap();
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["message"], "Invalid JSON");

    // Neither line authenticated the session, and it is still usable.
    client.send(json!({"command": "ping"})).await;
    assert_eq!(
        client.recv().await.unwrap()["message"],
        "Authentication required"
    );
    client
        .send(json!({"command": "auth", "password": "IoTDevice2024"}))
        .await;
    assert_eq!(client.recv_response().await["message"], "Authenticated");

    server.abort();
}

#[tokio::test]
async fn test_sixth_connection_gets_server_full() {
    let (addr, server) = start(DeviceSettings::default()).await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut client = TestClient::connect(addr).await;
        assert_eq!(client.recv().await.unwrap()["status"], "auth_required");
        clients.push(client);
    }

    let mut sixth = TestClient::connect(addr).await;
    assert_eq!(
        sixth.recv().await,
        Some(json!({"status": "error", "message": "Server full"}))
    );
    assert_eq!(sixth.recv().await, None);

    server.abort();
}

#[tokio::test]
async fn test_broadcast_only_reaches_authenticated_clients() {
    let settings = DeviceSettings {
        broadcast_interval_ms: 50,
        ..Default::default()
    };
    let (addr, server) = start(settings).await;

    let mut authed = TestClient::connect(addr).await;
    authed.authenticate().await;
    let mut pending = TestClient::connect(addr).await;
    pending.recv().await.unwrap();

    let status = loop {
        let value = authed.recv().await.unwrap();
        if value["type"] == "status" {
            break value;
        }
    };
    assert_eq!(status["buttons"].as_array().unwrap().len(), 5);
    assert!(status["potentiometer"]["raw"].is_u64());

    // Several broadcast periods later the pending client still has nothing
    let nothing = timeout(Duration::from_millis(300), pending.lines.next_line()).await;
    assert!(nothing.is_err(), "pending client received {nothing:?}");

    server.abort();
}

#[tokio::test]
async fn test_idle_session_is_evicted() {
    let settings = DeviceSettings {
        heartbeat_timeout_ms: 200,
        reap_interval_ms: 20,
        broadcast_interval_ms: 10_000,
        max_clients: 1,
        ..Default::default()
    };
    let (addr, server) = start(settings).await;

    let mut idle = TestClient::connect(addr).await;
    idle.authenticate().await;
    assert_eq!(idle.recv().await, None);

    // The freed slot is reused
    let mut next = TestClient::connect(addr).await;
    assert_eq!(next.recv().await.unwrap()["status"], "auth_required");

    server.abort();
}

#[tokio::test]
async fn test_servo_profile() {
    let settings = DeviceSettings::for_profile(BoardProfile::MultiServo);
    let (addr, server) = start(settings).await;
    let mut client = TestClient::connect(addr).await;
    client.authenticate().await;

    client
        .send(json!({"command": "set_servo", "servo_index": 2, "angle": 30}))
        .await;
    assert_eq!(
        client.recv_response().await["message"],
        "Servo 2 moved to 30 degrees"
    );

    client
        .send(json!({"command": "set_servo", "servo_index": 4, "angle": 30}))
        .await;
    assert_eq!(
        client.recv_response().await["message"],
        "Invalid servo index or angle"
    );

    client.send(json!({"command": "get_status"})).await;
    let status = loop {
        let value = client.recv().await.unwrap();
        if value["type"] == "status" {
            break value;
        }
    };
    assert_eq!(status["servos"][2], json!({"id": 2, "angle": 30}));

    server.abort();
}
