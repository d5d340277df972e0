//! DBus Queue Tests
//!
//! Drives a mock service through a private bus: the round trip from a client
//! call to a server function reply, FIFO ordering, bookkeeping of owned names
//! and exported objects, and the diagnostics produced by the assertions.

use mockbus_queue::{format_message, DBusQueue, QueueConfig, QueueHandle};
use mockbus_shared::init_test_logging;
use mockbus_transport::{
    error_names, Call, Connection, Ignore, InterfaceInfo, MainContext, MethodInfo, ObjectPath, PropertyAccess,
    PropertyInfo, Value, PROPERTIES_INTERFACE,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const SERVICE: &str = "com.example.Test";
const MANAGER_PATH: &str = "/com/example/Test";
const MANAGER: &str = "com.example.Test.Manager";
const OBJECT_PATH: &str = "/com/example/Test/Object123";
const OBJECT: &str = "com.example.Test.Object";

fn manager_interface() -> InterfaceInfo {
    InterfaceInfo::new(MANAGER).method(
        MethodInfo::new("GetObjectPath")
            .in_arg("id", "u")
            .out_arg("object_path", "o"),
    )
}

fn object_interface() -> InterfaceInfo {
    InterfaceInfo::new(OBJECT)
        .property(PropertyInfo::new("SomeStr", "s", PropertyAccess::Read))
        .property(PropertyInfo::new("SomeInt", "u", PropertyAccess::Read))
}

fn connected_queue() -> DBusQueue {
    init_test_logging();
    let mut queue = DBusQueue::new();
    queue.connect().unwrap();
    queue
}

fn export_service(queue: &QueueHandle) {
    queue.own_name(SERVICE);
    queue.export_object(MANAGER_PATH, &manager_interface()).unwrap();
    queue.export_object(OBJECT_PATH, &object_interface()).unwrap();
}

fn get_object_path_call(id: u32) -> Call {
    Call::new(SERVICE, MANAGER_PATH, MANAGER, "GetObjectPath")
        .body((id,))
        .reply_type("(o)")
}

fn get_all_call() -> Call {
    Call::new(SERVICE, OBJECT_PATH, PROPERTIES_INTERFACE, "GetAll")
        .body((OBJECT,))
        .reply_type("(a{sv})")
}

/// Answers one GetObjectPath call and one Properties.GetAll call
fn serve_series(queue: &QueueHandle) {
    let mut id = 0u32;
    let invocation = queue.assert_pop_message(MANAGER_PATH, MANAGER, "GetObjectPath", &mut [&mut id]);
    assert_eq!(id, 123);
    let path = ObjectPath::new(format!("{}/Object{}", MANAGER_PATH, id)).unwrap();
    invocation.return_value((path,));

    let mut interface_name = String::new();
    let invocation = queue.assert_pop_message(
        OBJECT_PATH,
        PROPERTIES_INTERFACE,
        "GetAll",
        &mut [&mut interface_name],
    );
    assert_eq!(interface_name, OBJECT);
    invocation.return_value((Value::vardict([
        ("SomeStr", Value::from("hello")),
        ("SomeInt", Value::from(11u32)),
    ]),));
}

fn check_properties(reply: &Value) {
    let properties = reply.child(0).unwrap();
    assert_eq!(properties.lookup("SomeStr"), Some(&Value::from("hello")));
    assert_eq!(properties.lookup("SomeInt"), Some(&Value::from(11u32)));
}

#[test]
fn test_connect_and_disconnect() {
    let mut queue = connected_queue();
    assert!(queue.is_connected());

    let client = queue.client_connection().unwrap();
    assert!(client.unique_name().starts_with(":1."));
    assert_eq!(queue.n_messages(), 0);

    queue.disconnect(true);
    assert!(!queue.is_connected());
    assert!(queue.client_connection().is_none());
    assert!(client.is_closed());
}

#[test]
fn test_series_sync() {
    let mut queue = connected_queue();
    export_service(&queue);
    queue.set_server_func(serve_series);

    let client = queue.client_connection().unwrap();
    let reply = client.call_sync(get_object_path_call(123)).unwrap();
    let (path,): (ObjectPath,) = reply.get().unwrap();
    assert_eq!(path.as_str(), OBJECT_PATH);

    let reply = client.call_sync(get_all_call()).unwrap();
    check_properties(&reply);

    queue.disconnect(true);
}

#[test]
fn test_series_async() {
    let mut queue = connected_queue();
    export_service(&queue);
    queue.set_server_func(serve_series);

    let client = queue.client_connection().unwrap();
    let context = MainContext::ref_thread_default();
    let result = Arc::new(parking_lot::Mutex::new(None));

    let slot = result.clone();
    client.call(get_object_path_call(123), move |reply| *slot.lock() = Some(reply));
    while result.lock().is_none() {
        context.iteration(true);
    }
    let reply = result.lock().take().unwrap().unwrap();
    assert_eq!(reply.to_string(), "(objectpath '/com/example/Test/Object123',)");

    let slot = result.clone();
    client.call(get_all_call(), move |reply| *slot.lock() = Some(reply));
    while result.lock().is_none() {
        context.iteration(true);
    }
    let reply = result.lock().take().unwrap().unwrap();
    check_properties(&reply);

    queue.disconnect(true);
}

#[test]
fn test_pop_order_on_constructing_thread() {
    let mut queue = connected_queue();
    export_service(&queue);
    let client = queue.client_connection().unwrap();

    for id in 0..10u32 {
        client.call(get_object_path_call(id), |_| {});
    }

    for expected in 0..10u32 {
        let mut id = u32::MAX;
        let invocation =
            queue.assert_pop_message(MANAGER_PATH, MANAGER, "GetObjectPath", &mut [&mut id]);
        assert_eq!(id, expected);
        invocation.return_value((ObjectPath::new(OBJECT_PATH).unwrap(),));
    }

    queue.disconnect(true);
}

#[test]
fn test_pop_order_on_server_thread() {
    let mut queue = connected_queue();
    export_service(&queue);
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let log = seen.clone();
    queue.set_server_func(move |queue| {
        for _ in 0..10 {
            let mut id = u32::MAX;
            let invocation =
                queue.assert_pop_message(MANAGER_PATH, MANAGER, "GetObjectPath", &mut [&mut id]);
            log.lock().push(id);
            invocation.return_value((ObjectPath::new(OBJECT_PATH).unwrap(),));
        }
    });

    let client = queue.client_connection().unwrap();
    let pending = Arc::new(AtomicUsize::new(10));
    for id in 0..10u32 {
        let pending = pending.clone();
        client.call(get_object_path_call(id), move |reply| {
            assert!(reply.is_ok());
            pending.fetch_sub(1, Ordering::SeqCst);
        });
    }

    let context = MainContext::ref_thread_default();
    while pending.load(Ordering::SeqCst) > 0 {
        context.iteration(true);
    }
    assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());

    queue.disconnect(true);
}

#[test]
fn test_try_pop_on_empty_queue() {
    let mut queue = connected_queue();
    assert!(queue.try_pop().is_none());
    assert_eq!(queue.n_messages(), 0);
    assert_eq!(queue.format_messages(), "");
    queue.assert_no_messages();
    queue.disconnect(true);
}

/// Issues `count` GetObjectPath calls and waits until all are queued
fn queue_calls(queue: &DBusQueue, count: u32) {
    let client = queue.client_connection().unwrap();
    for id in 0..count {
        client.call(get_object_path_call(id), |_| {});
    }
    let context = MainContext::ref_thread_default();
    while queue.n_messages() < count as usize {
        context.iteration(true);
    }
}

#[test]
fn test_format_messages_is_non_destructive() {
    let mut queue = connected_queue();
    export_service(&queue);
    queue_calls(&queue, 3);

    let first = queue.format_messages();
    let second = queue.format_messages();
    assert_eq!(first, second);
    assert_eq!(queue.n_messages(), 3);
    assert_eq!(first.matches("GetObjectPath").count(), 3);

    let mut ids = Vec::new();
    while let Some(invocation) = queue.try_pop() {
        let (id,): (u32,) = invocation.parameters().get().unwrap();
        ids.push(id);
        assert!(first.contains(&format_message(&invocation)));
        invocation.return_value((ObjectPath::new(OBJECT_PATH).unwrap(),));
    }
    assert_eq!(ids, vec![0, 1, 2]);

    queue.disconnect(true);
}

#[test]
fn test_match_client_message() {
    let mut queue = connected_queue();
    export_service(&queue);
    queue_calls(&queue, 1);

    let invocation = queue.try_pop().unwrap();
    assert!(queue.match_client_message(&invocation, MANAGER_PATH, MANAGER, "GetObjectPath", None));
    assert!(queue.match_client_message(
        &invocation,
        MANAGER_PATH,
        MANAGER,
        "GetObjectPath",
        Some(&Value::from((0u32,)))
    ));
    assert!(!queue.match_client_message(
        &invocation,
        MANAGER_PATH,
        MANAGER,
        "GetObjectPath",
        Some(&Value::from((1u32,)))
    ));
    assert!(!queue.match_client_message(&invocation, OBJECT_PATH, MANAGER, "GetObjectPath", None));
    assert!(!queue.match_client_message(&invocation, MANAGER_PATH, OBJECT, "GetObjectPath", None));
    invocation.return_value((ObjectPath::new(OBJECT_PATH).unwrap(),));

    queue.disconnect(true);
}

#[test]
fn test_slot_decode_failures_leave_slots_untouched() {
    let mut queue = connected_queue();
    export_service(&queue);
    queue_calls(&queue, 1);

    let mut wrong = String::from("untouched");
    let mut extra = 7u32;
    let invocation = queue.assert_pop_message(
        MANAGER_PATH,
        MANAGER,
        "GetObjectPath",
        &mut [&mut wrong, &mut extra],
    );
    assert_eq!(wrong, "untouched");
    assert_eq!(extra, 7);

    let mut ignored = Ignore;
    queue_calls(&queue, 1);
    let second = queue.assert_pop_message(MANAGER_PATH, MANAGER, "GetObjectPath", &mut [&mut ignored]);

    invocation.return_value((ObjectPath::new(OBJECT_PATH).unwrap(),));
    second.return_value((ObjectPath::new(OBJECT_PATH).unwrap(),));
    queue.disconnect(true);
}

#[test]
fn test_unpopped_messages_are_answered_with_no_reply() {
    let mut queue = connected_queue();
    export_service(&queue);
    let client = queue.client_connection().unwrap();
    let result = Arc::new(parking_lot::Mutex::new(None));

    let slot = result.clone();
    client.call(get_object_path_call(1), move |reply| *slot.lock() = Some(reply));
    let context = MainContext::ref_thread_default();
    while queue.n_messages() == 0 {
        context.iteration(true);
    }

    let invocation = queue.try_pop().unwrap();
    drop(invocation);
    while result.lock().is_none() {
        context.iteration(true);
    }
    let err = result.lock().take().unwrap().unwrap_err();
    assert_eq!(err.remote_name(), Some(error_names::NO_REPLY));

    queue.disconnect(true);
}

#[test]
fn test_own_two_names() {
    let mut queue = connected_queue();
    let first = queue.own_name("com.example.First");
    let second = queue.own_name("com.example.Second");
    assert_ne!(first, 0);
    assert_ne!(second, 0);
    assert_ne!(first, second);

    queue.unown_name(first);
    queue.unown_name(second);
    queue.disconnect(true);
}

#[test]
fn test_unexport_object() {
    let mut queue = connected_queue();
    queue.own_name(SERVICE);
    let id = queue.export_object(MANAGER_PATH, &manager_interface()).unwrap();
    queue.unexport_object(id);

    let client = queue.client_connection().unwrap();
    let err = client.call_sync(get_object_path_call(1)).unwrap_err();
    assert_eq!(err.remote_name(), Some(error_names::UNKNOWN_OBJECT));
    queue.disconnect(true);
}

#[test]
fn test_export_same_object_twice_is_an_error() {
    let mut queue = connected_queue();
    queue.export_object(MANAGER_PATH, &manager_interface()).unwrap();
    assert!(queue.export_object(MANAGER_PATH, &manager_interface()).is_err());
    queue.disconnect(true);
}

#[test]
fn test_registration_from_server_thread() {
    let mut queue = connected_queue();
    let exported = Arc::new(AtomicUsize::new(0));

    let flag = exported.clone();
    queue.set_server_func(move |queue| {
        queue.own_name(SERVICE);
        queue.export_object(MANAGER_PATH, &manager_interface()).unwrap();
        flag.store(1, Ordering::SeqCst);

        let mut id = 0u32;
        let invocation =
            queue.assert_pop_message(MANAGER_PATH, MANAGER, "GetObjectPath", &mut [&mut id]);
        invocation.return_value((ObjectPath::new(format!("{}/Object{}", MANAGER_PATH, id)).unwrap(),));
    });

    while exported.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    let client = queue.client_connection().unwrap();
    let reply = client.call_sync(get_object_path_call(5)).unwrap();
    assert_eq!(reply.get::<(ObjectPath,)>().unwrap().0.as_str(), "/com/example/Test/Object5");

    queue.disconnect(true);
}

#[test]
fn test_blocked_server_function_is_released_by_disconnect() {
    let mut queue = connected_queue();
    let released = Arc::new(AtomicUsize::new(0));

    let flag = released.clone();
    queue.set_server_func(move |queue| {
        assert!(queue.pop().is_none());
        flag.store(1, Ordering::SeqCst);
    });

    queue.disconnect(true);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_custom_config() {
    init_test_logging();
    let config = QueueConfig {
        server_thread_name: "custom-server".to_string(),
        install_debug_filter: false,
        default_call_timeout_ms: 100,
        // A subscriber is already installed, so this level is ignored.
        log_level: Some("trace".to_string()),
        ..Default::default()
    };
    let mut queue = DBusQueue::with_config(config);
    queue.connect().unwrap();

    queue.set_server_func(|_| {
        assert_eq!(thread::current().name(), Some("custom-server"));
    });

    queue.own_name(SERVICE);
    queue.export_object(MANAGER_PATH, &manager_interface()).unwrap();
    let client = queue.client_connection().unwrap();
    assert_eq!(client.default_timeout(), Duration::from_millis(100));

    // Nobody pops, so the call times out and the message stays queued.
    let err = client
        .call_sync(Call::new(SERVICE, MANAGER_PATH, MANAGER, "GetObjectPath").body((1u32,)))
        .unwrap_err();
    assert!(matches!(err, mockbus_shared::MockBusError::Timeout { .. }));
    let context = MainContext::ref_thread_default();
    while queue.n_messages() == 0 {
        context.iteration(true);
    }
    assert_eq!(queue.n_messages(), 1);

    queue.disconnect(false);
}

#[test]
#[should_panic(expected = "Expected no messages, but saw 1:")]
fn test_disconnect_with_pending_message_panics() {
    let mut queue = connected_queue();
    export_service(&queue);
    queue_calls(&queue, 1);
    queue.disconnect(true);
}

#[test]
#[should_panic(expected = "Expected message com.example.Test.Manager.GetObjectPath from /com/example/Test, but saw: ")]
fn test_assert_pop_message_mismatch_panics() {
    let queue = connected_queue();
    export_service(&queue);
    let client = queue.client_connection().unwrap();
    client.call(get_all_call(), |_| {});
    queue.assert_pop_message(MANAGER_PATH, MANAGER, "GetObjectPath", &mut []);
}

#[test]
#[should_panic(expected = "unown_name() called with unknown name ID")]
fn test_unown_unknown_name_panics() {
    let queue = connected_queue();
    queue.unown_name(u32::MAX);
}

#[test]
#[should_panic(expected = "unown_name() called with unknown name ID")]
fn test_unown_twice_panics() {
    let queue = connected_queue();
    let id = queue.own_name(SERVICE);
    queue.unown_name(id);
    queue.unown_name(id);
}

#[test]
#[should_panic(expected = "requires a valid object path")]
fn test_export_invalid_path_panics() {
    let queue = connected_queue();
    let _ = queue.export_object("com/example/Test", &manager_interface());
}

#[test]
#[should_panic(expected = "requires a well-known bus name")]
fn test_own_unique_name_panics() {
    let queue = connected_queue();
    queue.own_name(":1.42");
}

#[test]
#[should_panic(expected = "already has a server function")]
fn test_server_func_set_twice_panics() {
    let queue = connected_queue();
    queue.set_server_func(|_| {});
    queue.set_server_func(|_| {});
}

#[test]
#[should_panic(expected = "not connected")]
fn test_pop_before_connect_panics() {
    init_test_logging();
    let queue = DBusQueue::new();
    let _ = queue.pop();
}

#[test]
#[should_panic(expected = "pop() called on a queue which is not connected")]
fn test_pop_after_disconnect_panics() {
    let mut queue = connected_queue();
    queue.disconnect(true);
    let _ = queue.pop();
}

#[test]
#[should_panic(expected = "try_pop() called on a queue which is not connected")]
fn test_try_pop_after_disconnect_panics() {
    let mut queue = connected_queue();
    queue.disconnect(true);
    let _ = queue.try_pop();
}

#[test]
#[should_panic(expected = "try_pop() called on a queue which is not connected")]
fn test_try_pop_before_connect_panics() {
    init_test_logging();
    let queue = DBusQueue::new();
    let _ = queue.try_pop();
}

#[test]
fn test_reconnect_after_disconnect() {
    let mut queue = connected_queue();
    queue.disconnect(true);

    queue.connect().unwrap();
    assert!(queue.try_pop().is_none());
    queue.disconnect(true);
}

#[test]
#[should_panic(expected = "Expected message com.example.Test.Manager.GetObjectPath from /com/example/Test, but saw no messages")]
fn test_assert_pop_message_without_calls_panics() {
    let mut queue = connected_queue();
    queue.set_server_func(|queue| {
        queue.assert_pop_message(MANAGER_PATH, MANAGER, "GetObjectPath", &mut []);
    });
    queue.disconnect(true);
}

/// Queues one GetObjectPath call sent by a connection other than the client's
fn queue_call_from_other_sender(queue: &DBusQueue) -> Connection {
    let other = Connection::open(queue.bus_address().unwrap()).unwrap();
    other.call(get_object_path_call(7), |_| {});
    let context = MainContext::ref_thread_default();
    while queue.n_messages() == 0 {
        context.iteration(true);
    }
    other
}

#[test]
fn test_match_client_message_checks_sender() {
    let mut queue = connected_queue();
    export_service(&queue);
    let other = queue_call_from_other_sender(&queue);

    let invocation = queue.pop().unwrap();
    assert_eq!(invocation.sender(), other.unique_name());
    assert_eq!(invocation.method_name(), "GetObjectPath");
    assert!(!queue.match_client_message(&invocation, MANAGER_PATH, MANAGER, "GetObjectPath", None));
    drop(invocation);

    other.close();
    queue.disconnect(true);
}

#[test]
#[should_panic(expected = "Expected message com.example.Test.Manager.GetObjectPath from /com/example/Test, but saw: ")]
fn test_assert_pop_message_from_other_sender_panics() {
    let queue = connected_queue();
    export_service(&queue);
    let _other = queue_call_from_other_sender(&queue);
    queue.assert_pop_message(MANAGER_PATH, MANAGER, "GetObjectPath", &mut []);
}

#[test]
#[should_panic(expected = "member -> 'GetObjectPath'")]
fn test_assert_no_messages_dumps_pending_calls() {
    let queue = connected_queue();
    export_service(&queue);
    queue_calls(&queue, 1);
    queue.assert_no_messages();
}

#[test]
fn test_call_without_timeout_bound() {
    let mut queue = connected_queue();
    export_service(&queue);
    queue.set_server_func(|queue| {
        let mut id = 0u32;
        let invocation = queue.assert_pop_message(MANAGER_PATH, MANAGER, "GetObjectPath", &mut [&mut id]);
        invocation.return_value((ObjectPath::new(format!("{}/Object{}", MANAGER_PATH, id)).unwrap(),));
    });

    let client = queue.client_connection().unwrap();
    let reply = client
        .call_sync(get_object_path_call(9).timeout(Duration::MAX))
        .unwrap();
    assert_eq!(reply.get::<(ObjectPath,)>().unwrap().0.as_str(), "/com/example/Test/Object9");

    queue.disconnect(true);
}

#[test]
fn test_server_function_may_consume_captured_state() {
    let mut queue = connected_queue();
    let (tx, rx) = mpsc::channel::<Vec<String>>();
    let owned = vec!["first".to_string(), "second".to_string()];

    queue.set_server_func(move |_| {
        tx.send(owned).unwrap();
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), ["first", "second"]);
    queue.disconnect(true);
}

#[test]
#[should_panic(expected = "already has a server function")]
fn test_server_func_cannot_be_replaced_after_running() {
    let mut queue = connected_queue();
    let (tx, rx) = mpsc::channel();
    queue.set_server_func(move |_| {
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        queue.set_server_func(|_| {});
    }));
    queue.disconnect(true);
    if let Err(payload) = result {
        std::panic::resume_unwind(payload);
    }
}

#[test]
#[should_panic(expected = "server function failed")]
fn test_server_function_panic_is_raised_at_disconnect() {
    let mut queue = connected_queue();
    queue.set_server_func(|_| panic!("server function failed"));
    queue.disconnect(true);
}

#[test]
fn test_server_function_panic_closes_server_connection() {
    let mut queue = connected_queue();
    queue.own_name(SERVICE);
    queue.export_object(MANAGER_PATH, &manager_interface()).unwrap();
    queue.set_server_func(|_| panic!("server function failed"));

    // Once the server connection is gone the name has no owner.
    let client = queue.client_connection().unwrap();
    let mut err = client.call_sync(get_object_path_call(1)).unwrap_err();
    for _ in 0..200 {
        if err.remote_name() == Some(error_names::SERVICE_UNKNOWN) {
            break;
        }
        thread::sleep(Duration::from_millis(5));
        err = client.call_sync(get_object_path_call(1)).unwrap_err();
    }
    assert_eq!(err.remote_name(), Some(error_names::SERVICE_UNKNOWN));

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| queue.disconnect(false)));
    assert!(result.is_err());
}
