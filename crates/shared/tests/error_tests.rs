//! Error Tests
//!
//! Tests for error construction, classification, and conversion.

use mockbus_shared::error::MockBusError;
use std::time::Duration;

#[test]
fn test_error_construction() {
    let transport_err = MockBusError::transport("no bus", None);
    assert!(matches!(transport_err, MockBusError::Transport { .. }));

    let closed_err = MockBusError::closed("Connection :1.4");
    assert!(matches!(closed_err, MockBusError::Closed { .. }));
    assert_eq!(closed_err.to_string(), "Connection :1.4 is closed");

    let timeout_err = MockBusError::timeout(Duration::from_millis(1500), "GetObjectPath");
    assert_eq!(
        timeout_err.to_string(),
        "Operation timed out after 1500ms: GetObjectPath"
    );

    let registration_err = MockBusError::registration("/com/example/Test", "already exported");
    assert_eq!(
        registration_err.to_string(),
        "Registration of /com/example/Test failed: already exported"
    );
}

#[test]
fn test_remote_error_name() {
    let err = MockBusError::remote("org.freedesktop.DBus.Error.UnknownMethod", "no such method");
    assert_eq!(
        err.remote_name(),
        Some("org.freedesktop.DBus.Error.UnknownMethod")
    );
    assert_eq!(
        err.to_string(),
        "org.freedesktop.DBus.Error.UnknownMethod: no such method"
    );

    assert_eq!(MockBusError::invalid_argument("bad").remote_name(), None);
}

#[test]
fn test_temporary_classification() {
    assert!(MockBusError::timeout(Duration::from_secs(1), "op").is_temporary());

    let unbounded = MockBusError::timeout(Duration::MAX, "op");
    assert!(matches!(unbounded, MockBusError::Timeout { timeout_ms: u64::MAX, .. }));
    assert!(MockBusError::remote("org.freedesktop.DBus.Error.NoReply", "").is_temporary());
    assert!(!MockBusError::remote("org.freedesktop.DBus.Error.UnknownObject", "").is_temporary());
    assert!(!MockBusError::closed("bus").is_temporary());
    assert!(!MockBusError::decode("u", "s").is_temporary());
    assert!(!MockBusError::transport("down", None).is_temporary());
}

#[test]
fn test_transport_error_source() {
    use std::error::Error;

    let io = std::io::Error::from(std::io::ErrorKind::NotFound);
    let err = MockBusError::transport("cannot open", Some(Box::new(io)));
    assert!(err.source().is_some());
}

#[test]
fn test_oneshot_recv_error_conversion() {
    let (tx, rx) = tokio::sync::oneshot::channel::<u32>();
    drop(tx);
    let err: MockBusError = rx.blocking_recv().unwrap_err().into();
    assert!(matches!(err, MockBusError::Closed { .. }));
}
