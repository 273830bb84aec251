//! End-to-end polling tests
//!
//! These tests run the full inbound and outbound path against the mock
//! adapter:
//! 1. Open a session (detection + adapter init)
//! 2. Start polling a registry parameter
//! 3. Let the mock answer the request
//! 4. Verify the parsed value reaches the update sink

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use vcu_link::config::LinkConfig;
use vcu_link::transport::mock::MockChannel;
use vcu_link::{
    AdapterType, CanId, Channel, ParameterRegistry, ParameterSpec, ParseError, RequestDescriptor,
    Session, UpdateSink,
};

const VOLTAGE_REPLY: &str = "7BB 07 62 03 01 00 00 01 68";

fn id(s: &str) -> CanId {
    s.parse().unwrap()
}

/// Big-endian 16-bit value following the identifier's first data byte
fn voltage(data_hex: &str) -> Result<Option<Value>, ParseError> {
    let digits = data_hex
        .get(10..14)
        .ok_or_else(|| ParseError::InvalidData(data_hex.to_string()))?;
    let raw = u16::from_str_radix(digits, 16)
        .map_err(|_| ParseError::InvalidData(data_hex.to_string()))?;
    Ok(Some(json!(raw)))
}

fn voltage_registry(interval_ms: u64) -> ParameterRegistry {
    let mut registry = ParameterRegistry::new();
    let request = RequestDescriptor::new(id("79B"), "220301", interval_ms).unwrap();
    registry.insert(
        ParameterSpec::new("battery_voltage", request, id("7BB"), voltage).with_unit("V"),
    );
    registry
}

fn update_channel() -> (Arc<dyn UpdateSink>, mpsc::UnboundedReceiver<(String, Value)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn UpdateSink> = Arc::new(move |parameter_id: &str, value: &Value| {
        let _ = tx.send((parameter_id.to_string(), value.clone()));
    });
    (sink, rx)
}

async fn open(mock: &Arc<MockChannel>) -> Session {
    let channel: Arc<dyn Channel> = mock.clone();
    Session::open(channel, LinkConfig::default()).await.unwrap()
}

async fn next_update(rx: &mut mpsc::UnboundedReceiver<(String, Value)>) -> (String, Value) {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no update within 5s")
        .expect("update channel closed")
}

#[tokio::test(start_paused = true)]
async fn test_command_style_reply_with_header_yields_value() {
    let mock = Arc::new(MockChannel::command_style());
    mock.add_response("220301", format!("{}\r\r>", VOLTAGE_REPLY));
    let session = open(&mock).await;
    let (sink, mut updates) = update_channel();

    session
        .start_polling(&["battery_voltage"], &voltage_registry(1000), sink)
        .unwrap();

    assert_eq!(
        next_update(&mut updates).await,
        ("battery_voltage".to_string(), json!(1))
    );
    assert!(mock.writes().ends_with(&["ATSH79B".to_string(), "220301".to_string()]));
}

#[tokio::test(start_paused = true)]
async fn test_command_style_reply_without_header_yields_value() {
    let mock = Arc::new(MockChannel::command_style());
    mock.add_response("220301", "07 62 03 01 00 00 01 68\r\r>");
    let session = open(&mock).await;
    let (sink, mut updates) = update_channel();

    session
        .start_polling(&["battery_voltage"], &voltage_registry(1000), sink)
        .unwrap();

    assert_eq!(next_update(&mut updates).await.1, json!(1));
}

#[tokio::test(start_paused = true)]
async fn test_frame_style_reply_yields_value() {
    let mock = Arc::new(MockChannel::frame_style());
    mock.add_response("t79B403220301", "z\rt7BB80762030100000168\r");
    let session = open(&mock).await;
    assert_eq!(session.adapter_type(), AdapterType::FrameStyle);
    let (sink, mut updates) = update_channel();

    session
        .start_polling(&["battery_voltage"], &voltage_registry(1000), sink)
        .unwrap();

    assert_eq!(next_update(&mut updates).await.1, json!(1));
}

#[tokio::test(start_paused = true)]
async fn test_polling_repeats_until_stopped() {
    let mock = Arc::new(MockChannel::command_style());
    mock.add_response("220301", format!("{}\r\r>", VOLTAGE_REPLY));
    let session = open(&mock).await;
    let (sink, mut updates) = update_channel();

    session
        .start_polling(&["battery_voltage"], &voltage_registry(200), sink)
        .unwrap();
    for _ in 0..3 {
        next_update(&mut updates).await;
    }

    session.stop_all_polling();
    let sent = mock.writes().iter().filter(|w| *w == "220301").count();
    sleep(Duration::from_secs(2)).await;

    assert_eq!(mock.writes().iter().filter(|w| *w == "220301").count(), sent);
    assert!(updates.try_recv().is_err());
    assert!(session.polling().active_groups().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_noise_and_stale_replies_are_ignored() {
    let mock = Arc::new(MockChannel::command_style());
    let session = open(&mock).await;
    let (sink, mut updates) = update_channel();

    session
        .start_polling(&["battery_voltage"], &voltage_registry(1000), sink)
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    // Garbage, a reply for another identifier, then the real one
    mock.inject("GARBAGE LINE\r7BB 07 62 03 02 00 00 05 00\r");
    mock.inject(format!("{}\r\r>", VOLTAGE_REPLY));

    assert_eq!(next_update(&mut updates).await.1, json!(1));
    sleep(Duration::from_millis(100)).await;
    assert!(updates.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_keeps_session_alive() {
    let mock = Arc::new(MockChannel::command_style());
    mock.add_response("220301", format!("{}\r\r>", VOLTAGE_REPLY));
    let session = open(&mock).await;
    let (sink, mut updates) = update_channel();

    mock.fail_writes_when(|cmd| cmd == "220301");
    session
        .start_polling(&["battery_voltage"], &voltage_registry(200), sink)
        .unwrap();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(session.polling().pending_count(), 0);
    assert!(updates.try_recv().is_err());

    mock.clear_write_failure();
    assert_eq!(next_update(&mut updates).await.1, json!(1));
    assert!(session.is_connected());
}
