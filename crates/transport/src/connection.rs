//! Connections to a private bus
//!
//! A [`Connection`] is a cheap, cloneable handle. It can issue method calls
//! (blocking or callback-based), own well-known names, export objects that
//! answer calls and install message filters.
//!
//! Incoming messages are handed to the connection on the bus router thread.
//! Replies complete the waiting call directly; method calls are matched to
//! an exported object and its handler is posted to the [`MainContext`] that
//! was thread-default when the object was registered.

use crate::bus::{self, BusCommand, ReleaseNameReply};
use crate::interface::{InterfaceInfo, MethodInfo};
use crate::invocation::MethodInvocation;
use crate::main_context::MainContext;
use crate::message::{error_names, Message, MessageType};
use crate::names::{is_well_known_name, ObjectPath};
use crate::value::Value;
use mockbus_shared::{MockBusError, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

/// Interface name of the standard properties interface
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Timeout applied to blocking calls that don't set their own
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

static NEXT_OBJECT_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_OWNER_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_FILTER_ID: AtomicU32 = AtomicU32::new(1);

static PROPERTIES_INFO: LazyLock<InterfaceInfo> = LazyLock::new(|| {
    InterfaceInfo::new(PROPERTIES_INTERFACE)
        .method(
            MethodInfo::new("Get")
                .in_arg("interface_name", "s")
                .in_arg("property_name", "s")
                .out_arg("value", "v"),
        )
        .method(
            MethodInfo::new("GetAll")
                .in_arg("interface_name", "s")
                .out_arg("properties", "a{sv}"),
        )
        .method(
            MethodInfo::new("Set")
                .in_arg("interface_name", "s")
                .in_arg("property_name", "s")
                .in_arg("value", "v"),
        )
});

/// Descriptor of `org.freedesktop.DBus.Properties`
pub fn properties_interface() -> &'static InterfaceInfo {
    &PROPERTIES_INFO
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Handler invoked for every method call on an exported object
pub type MethodHandler = Arc<dyn Fn(MethodInvocation) + Send + Sync + 'static>;

type MessageFilter = Arc<dyn Fn(&Message, FilterDirection) + Send + Sync + 'static>;
type CallCallback = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

/// Which way a message passed through a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDirection {
    Incoming,
    Outgoing,
}

/// A method call to issue on a [`Connection`]
///
/// # Examples
///
/// ```rust
/// use mockbus_transport::{Call, Value};
/// use std::time::Duration;
///
/// let call = Call::new("com.example.Test", "/com/example/Test", "com.example.Test.Manager", "GetObjectPath")
///     .body((123u32,))
///     .reply_type("(o)")
///     .timeout(Duration::from_secs(1));
/// assert_eq!(call.member(), "GetObjectPath");
/// ```
#[derive(Debug, Clone)]
pub struct Call {
    destination: Option<String>,
    path: String,
    interface: Option<String>,
    member: String,
    body: Value,
    reply_type: Option<String>,
    timeout: Option<Duration>,
    no_reply_expected: bool,
}

impl Call {
    pub fn new(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        Self {
            destination: Some(destination.to_string()),
            path: path.to_string(),
            interface: Some(interface.to_string()),
            member: member.to_string(),
            body: Value::unit(),
            reply_type: None,
            timeout: None,
            no_reply_expected: false,
        }
    }

    /// Argument tuple; a non-tuple value is sent as a single argument
    pub fn body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    /// Expected reply type as a tuple signature, e.g. `"(o)"`
    pub fn reply_type(mut self, signature: &str) -> Self {
        self.reply_type = Some(signature.to_string());
        self
    }

    /// Timeout for [`Connection::call_sync`]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Don't wait for a reply; the call completes as soon as it is sent
    pub fn no_reply_expected(mut self) -> Self {
        self.no_reply_expected = true;
        self
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    fn describe(&self) -> String {
        format!(
            "{}.{} on {}",
            self.interface.as_deref().unwrap_or("<any>"),
            self.member,
            self.path
        )
    }

    fn into_message(self) -> Result<Message> {
        let path = ObjectPath::new(self.path)?;
        let mut message = Message::method_call(
            self.destination.as_deref(),
            path,
            self.interface.as_deref(),
            &self.member,
            self.body,
        );
        message.no_reply_expected = self.no_reply_expected;
        Ok(message)
    }
}

struct ReplySlot {
    reply: Mutex<Option<Result<Message>>>,
    ready: Condvar,
}

impl ReplySlot {
    fn new() -> Self {
        Self {
            reply: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, reply: Result<Message>) {
        *self.reply.lock() = Some(reply);
        self.ready.notify_all();
    }
}

enum PendingReply {
    Blocking(Arc<ReplySlot>),
    Callback {
        context: MainContext,
        reply_type: Option<String>,
        callback: CallCallback,
    },
}

impl PendingReply {
    fn complete(self, reply: Result<Message>) {
        match self {
            PendingReply::Blocking(slot) => slot.complete(reply),
            PendingReply::Callback {
                context,
                reply_type,
                callback,
            } => context.invoke(move || callback(finish_call(reply, reply_type.as_deref()))),
        }
    }
}

/// Turns a raw reply into the caller-facing result
fn finish_call(reply: Result<Message>, reply_type: Option<&str>) -> Result<Value> {
    let message = reply?;
    if let Some(error) = message.to_error() {
        return Err(error);
    }
    if let Some(expected) = reply_type {
        let actual = message.body.signature();
        if actual != expected {
            return Err(MockBusError::invalid_argument(format!(
                "Method returned type '{}', but expected '{}'",
                actual, expected
            )));
        }
    }
    Ok(message.body)
}

struct Registration {
    path: ObjectPath,
    interface: Arc<InterfaceInfo>,
    handler: MethodHandler,
    context: MainContext,
}

pub(crate) struct ConnectionInner {
    unique_name: String,
    inbox: mpsc::UnboundedSender<BusCommand>,
    closed: AtomicBool,
    next_serial: AtomicU32,
    default_timeout_ms: AtomicU64,
    pending: Mutex<HashMap<u32, PendingReply>>,
    objects: RwLock<HashMap<u32, Registration>>,
    owned_names: Mutex<HashMap<u32, String>>,
    filters: RwLock<Vec<(u32, MessageFilter)>>,
}

/// Handle to one connection on a private bus
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.inner.unique_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Opens a new connection to the bus at `address`
    ///
    /// Fails with a transport error if no bus is up at that address.
    #[instrument]
    pub fn open(address: &str) -> Result<Connection> {
        let core = bus::lookup_address(address)?;
        let unique_name = core.allocate_unique_name();
        let inner = Arc::new(ConnectionInner {
            unique_name: unique_name.clone(),
            inbox: core.inbox(),
            closed: AtomicBool::new(false),
            next_serial: AtomicU32::new(1),
            default_timeout_ms: AtomicU64::new(saturating_millis(DEFAULT_CALL_TIMEOUT)),
            pending: Mutex::new(HashMap::new()),
            objects: RwLock::new(HashMap::new()),
            owned_names: Mutex::new(HashMap::new()),
            filters: RwLock::new(Vec::new()),
        });

        inner
            .inbox
            .send(BusCommand::Attach {
                unique_name: unique_name.clone(),
                connection: Arc::downgrade(&inner),
            })
            .map_err(|_| {
                MockBusError::transport(format!("bus at '{}' went down", address), None)
            })?;

        debug!(unique_name = %unique_name, "Connection opened");
        Ok(Connection { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    /// Unique bus name of this connection, e.g. `:1.3`
    pub fn unique_name(&self) -> &str {
        &self.inner.unique_name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same connection
    pub fn is_same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Sets the timeout used by [`call_sync`](Self::call_sync) when the call has none
    pub fn set_default_timeout(&self, timeout: Duration) {
        self.inner
            .default_timeout_ms
            .store(saturating_millis(timeout), Ordering::Relaxed);
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.default_timeout_ms.load(Ordering::Relaxed))
    }

    /// Sends `message`, returning the serial it was given
    pub fn send_message(&self, message: Message) -> Result<u32> {
        self.inner.send(message, None)
    }

    /// Issues a method call and blocks until the reply or the timeout
    ///
    /// Returns the reply's argument tuple. Error replies become
    /// [`MockBusError::Remote`].
    pub fn call_sync(&self, call: Call) -> Result<Value> {
        let timeout = call.timeout.unwrap_or_else(|| self.default_timeout());
        let reply_type = call.reply_type.clone();
        let operation = call.describe();
        let no_reply = call.no_reply_expected;
        let message = call.into_message()?;

        if no_reply {
            self.inner.send(message, None)?;
            return Ok(Value::unit());
        }

        let slot = Arc::new(ReplySlot::new());
        let serial = self
            .inner
            .send(message, Some(PendingReply::Blocking(slot.clone())))?;

        // A deadline past the end of representable time means wait forever.
        let deadline = Instant::now().checked_add(timeout);
        let mut reply = slot.reply.lock();
        while reply.is_none() {
            match deadline {
                Some(deadline) => {
                    if slot.ready.wait_until(&mut reply, deadline).timed_out() {
                        break;
                    }
                }
                None => slot.ready.wait(&mut reply),
            }
        }

        let result = match reply.take() {
            Some(reply) => finish_call(reply, reply_type.as_deref()),
            None => {
                self.inner.pending.lock().remove(&serial);
                Err(MockBusError::timeout(timeout, operation))
            }
        };
        if let Err(e) = &result {
            debug!(
                serial,
                temporary = e.is_temporary(),
                error = %e,
                "Blocking call failed"
            );
        }
        result
    }

    /// Issues a method call and delivers the result to `callback`
    ///
    /// The callback runs in the caller's thread-default [`MainContext`], so
    /// the caller must iterate that context to receive it. Errors that occur
    /// before the call is sent are delivered the same way.
    pub fn call<F>(&self, call: Call, callback: F)
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let context = MainContext::ref_thread_default();
        let reply_type = call.reply_type.clone();
        let no_reply = call.no_reply_expected;

        let message = match call.into_message() {
            Ok(message) => message,
            Err(e) => {
                context.invoke(move || callback(Err(e)));
                return;
            }
        };

        if no_reply {
            let result = self.inner.send(message, None).map(|_| Value::unit());
            context.invoke(move || callback(result));
            return;
        }

        let pending = PendingReply::Callback {
            context: context.clone(),
            reply_type,
            callback: Box::new(callback),
        };
        // On failure the pending entry has already been completed with the error.
        let _ = self.inner.send(message, Some(pending));
    }

    /// Requests ownership of a well-known name
    ///
    /// Returns an ID for [`unown_name`](Self::unown_name). If another
    /// connection owns the name already, this connection is queued and takes
    /// over when the current owner releases it.
    #[instrument(skip(self), fields(unique_name = %self.inner.unique_name))]
    pub fn own_name(&self, name: &str) -> Result<u32> {
        if !is_well_known_name(name) {
            return Err(MockBusError::invalid_argument(format!(
                "'{}' is not a valid well-known bus name",
                name
            )));
        }
        self.inner.ensure_open()?;

        let (tx, rx) = oneshot::channel();
        self.inner
            .inbox
            .send(BusCommand::RequestName {
                unique_name: self.inner.unique_name.clone(),
                name: name.to_string(),
                reply: tx,
            })
            .map_err(|_| MockBusError::closed("bus"))?;
        let reply = rx.blocking_recv()?;

        let id = NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed);
        self.inner.owned_names.lock().insert(id, name.to_string());
        debug!(name = %name, id, reply = ?reply, "Owning name");
        Ok(id)
    }

    /// Releases a name owned through [`own_name`](Self::own_name)
    ///
    /// Returns `false` if `id` is unknown.
    pub fn unown_name(&self, id: u32) -> bool {
        let Some(name) = self.inner.owned_names.lock().remove(&id) else {
            return false;
        };
        if self.is_closed() {
            debug!(name = %name, id, "Connection closed; name already released");
            return true;
        }

        let (tx, rx) = oneshot::channel();
        let sent = self.inner.inbox.send(BusCommand::ReleaseName {
            unique_name: self.inner.unique_name.clone(),
            name: name.clone(),
            reply: tx,
        });
        match sent.map_err(|_| MockBusError::closed("bus")).and_then(|_| {
            rx.blocking_recv().map_err(MockBusError::from)
        }) {
            Ok(ReleaseNameReply::Released) => debug!(name = %name, id, "Unowned name"),
            Ok(other) => warn!(name = %name, id, reply = ?other, "Failed to release name"),
            Err(e) => warn!(name = %name, id, error = %e, "Failed to release name"),
        }
        true
    }

    /// Exports an object implementing `interface` at `path`
    ///
    /// `handler` runs in the thread-default [`MainContext`] of the calling
    /// thread for every method call on this path and interface, including
    /// `org.freedesktop.DBus.Properties` calls naming the interface.
    pub fn register_object<F>(&self, path: &str, interface: &InterfaceInfo, handler: F) -> Result<u32>
    where
        F: Fn(MethodInvocation) + Send + Sync + 'static,
    {
        self.inner.ensure_open()?;
        let path = ObjectPath::new(path)?;
        interface.validate()?;

        let mut objects = self.inner.objects.write();
        if objects
            .values()
            .any(|r| r.path == path && r.interface.name == interface.name)
        {
            return Err(MockBusError::registration(
                format!("{} at {}", interface.name, path),
                "an object is already exported for this interface",
            ));
        }

        let id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path, interface = %interface.name, id, "Registered object");
        objects.insert(
            id,
            Registration {
                path,
                interface: Arc::new(interface.clone()),
                handler: Arc::new(handler),
                context: MainContext::ref_thread_default(),
            },
        );
        Ok(id)
    }

    /// Removes an exported object; returns `false` if `id` is unknown
    pub fn unregister_object(&self, id: u32) -> bool {
        match self.inner.objects.write().remove(&id) {
            Some(registration) => {
                debug!(path = %registration.path, interface = %registration.interface.name, id, "Unregistered object");
                true
            }
            None => false,
        }
    }

    /// Installs a filter that sees every incoming and outgoing message
    ///
    /// Incoming messages are filtered on the bus router thread, outgoing ones
    /// on the sending thread. Filters observe messages; they cannot alter or
    /// drop them.
    pub fn add_filter<F>(&self, filter: F) -> u32
    where
        F: Fn(&Message, FilterDirection) + Send + Sync + 'static,
    {
        let id = NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed);
        self.inner.filters.write().push((id, Arc::new(filter)));
        id
    }

    /// Removes a filter; returns `false` if `id` is unknown
    pub fn remove_filter(&self, id: u32) -> bool {
        let mut filters = self.inner.filters.write();
        let before = filters.len();
        filters.retain(|(filter_id, _)| *filter_id != id);
        filters.len() != before
    }

    /// Detaches from the bus
    ///
    /// Outstanding calls fail with [`MockBusError::Closed`], exported
    /// objects and filters are dropped and owned names are released by the
    /// bus. Closing twice is harmless.
    pub fn close(&self) {
        self.inner.shut(true);
    }
}

impl ConnectionInner {
    pub(crate) fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(MockBusError::closed(format!("connection {}", self.unique_name)))
        } else {
            Ok(())
        }
    }

    fn run_filters(&self, message: &Message, direction: FilterDirection) {
        let filters: Vec<MessageFilter> = self.filters.read().iter().map(|(_, f)| f.clone()).collect();
        for filter in filters {
            filter(message, direction);
        }
    }

    /// Assigns a serial and hands the message to the router
    ///
    /// If `pending` is given it is completed when the reply arrives. When
    /// sending fails it is completed with the error right away.
    fn send(&self, mut message: Message, pending: Option<PendingReply>) -> Result<u32> {
        if let Err(e) = self.ensure_open() {
            if let Some(pending) = pending {
                pending.complete(Err(MockBusError::closed(format!("connection {}", self.unique_name))));
            }
            return Err(e);
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        message.serial = serial;
        message.sender = Some(self.unique_name.clone());

        if let Some(pending) = pending {
            self.pending.lock().insert(serial, pending);
            // close() may have drained the table between the check above and the insert
            if self.is_closed() {
                if let Some(pending) = self.pending.lock().remove(&serial) {
                    pending.complete(Err(MockBusError::closed(format!(
                        "connection {}",
                        self.unique_name
                    ))));
                }
                return Err(MockBusError::closed(format!("connection {}", self.unique_name)));
            }
        }

        self.run_filters(&message, FilterDirection::Outgoing);
        trace!(serial, unique_name = %self.unique_name, "Sending message");

        if self.inbox.send(BusCommand::Send { message }).is_err() {
            if let Some(pending) = self.pending.lock().remove(&serial) {
                pending.complete(Err(MockBusError::closed("bus")));
            }
            return Err(MockBusError::closed("bus"));
        }
        Ok(serial)
    }

    /// Sends a reply produced by a method invocation; failures are only logged
    pub(crate) fn send_reply(&self, reply: Message) {
        if let Err(e) = self.send(reply, None) {
            debug!(unique_name = %self.unique_name, error = %e, "Dropping reply");
        }
    }

    fn reply_error(&self, call: &Message, error_name: &str, text: &str) {
        if call.expects_reply() {
            self.send_reply(Message::error(call, error_name, text));
        }
    }

    /// Handles a message routed to this connection; runs on the router thread
    pub(crate) fn deliver(self: &Arc<Self>, message: Message) {
        if self.is_closed() {
            return;
        }
        self.run_filters(&message, FilterDirection::Incoming);

        match message.message_type {
            MessageType::MethodReturn | MessageType::Error => {
                let pending = message
                    .reply_serial
                    .and_then(|serial| self.pending.lock().remove(&serial));
                match pending {
                    Some(pending) => pending.complete(Ok(message)),
                    None => trace!(reply_serial = ?message.reply_serial, "Reply without a waiting call"),
                }
            }
            MessageType::MethodCall => self.dispatch_call(message),
            MessageType::Signal => {
                trace!(member = ?message.member, "Ignoring signal");
            }
        }
    }

    fn dispatch_call(self: &Arc<Self>, message: Message) {
        let Some(path) = message.path.clone() else {
            self.reply_error(&message, error_names::UNKNOWN_OBJECT, "Method call without a path");
            return;
        };
        let member = message.member.clone().unwrap_or_default();

        let target = {
            let objects = self.objects.read();
            let at_path: Vec<&Registration> = objects.values().filter(|r| r.path == path).collect();

            let lookup = match message.interface.as_deref() {
                _ if at_path.is_empty() => Err((
                    error_names::UNKNOWN_OBJECT,
                    format!("No such object path '{}'", path),
                )),
                Some(PROPERTIES_INTERFACE) => match message.body.child(0) {
                    Some(Value::Str(target)) => at_path
                        .iter()
                        .find(|r| &r.interface.name == target)
                        .ok_or_else(|| {
                            (
                                error_names::UNKNOWN_INTERFACE,
                                format!("No such interface '{}' on object at path {}", target, path),
                            )
                        })
                        .and_then(|r| {
                            properties_interface()
                                .lookup_method(&member)
                                .map(|m| (*r, m.clone()))
                                .ok_or_else(|| {
                                    (error_names::UNKNOWN_METHOD, format!("No such method '{}'", member))
                                })
                        }),
                    _ => Err((
                        error_names::INVALID_ARGS,
                        format!("{} call without an interface name argument", PROPERTIES_INTERFACE),
                    )),
                },
                Some(interface) => at_path
                    .iter()
                    .find(|r| r.interface.name == interface)
                    .ok_or_else(|| {
                        (
                            error_names::UNKNOWN_INTERFACE,
                            format!("No such interface '{}' on object at path {}", interface, path),
                        )
                    })
                    .and_then(|r| {
                        r.interface
                            .lookup_method(&member)
                            .map(|m| (*r, m.clone()))
                            .ok_or_else(|| {
                                (error_names::UNKNOWN_METHOD, format!("No such method '{}'", member))
                            })
                    }),
                None => at_path
                    .iter()
                    .find_map(|r| r.interface.lookup_method(&member).map(|m| (*r, m.clone())))
                    .ok_or_else(|| (error_names::UNKNOWN_METHOD, format!("No such method '{}'", member))),
            };

            lookup.map(|(registration, method)| {
                (
                    registration.handler.clone(),
                    registration.context.clone(),
                    method,
                )
            })
        };

        let (handler, context, method) = match target {
            Ok(target) => target,
            Err((error_name, text)) => {
                self.reply_error(&message, error_name, &text);
                return;
            }
        };

        let actual = message.signature();
        let expected = method.in_signature();
        if actual != expected {
            self.reply_error(
                &message,
                error_names::INVALID_ARGS,
                &format!(
                    "Type of message, '({})', does not match expected type '({})'",
                    actual, expected
                ),
            );
            return;
        }

        let invocation = MethodInvocation::new(
            Connection {
                inner: self.clone(),
            },
            message,
            Some(method),
        );
        context.invoke(move || handler(invocation));
    }

    fn fail_pending(&self) {
        let pending: Vec<PendingReply> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for p in pending {
            p.complete(Err(MockBusError::closed(format!("connection {}", self.unique_name))));
        }
    }

    fn shut(&self, notify_bus: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if notify_bus {
            let _ = self.inbox.send(BusCommand::Detach {
                unique_name: self.unique_name.clone(),
            });
        }

        self.fail_pending();
        // Registrations and filters may capture handles to their owners.
        self.objects.write().clear();
        self.filters.write().clear();
        self.owned_names.lock().clear();
        debug!(unique_name = %self.unique_name, "Connection closed");
    }

    /// Marks the connection closed because the bus itself went down
    pub(crate) fn close_from_bus(&self) {
        self.shut(false);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.inbox.send(BusCommand::Detach {
                unique_name: self.unique_name.clone(),
            });
        }
    }
}
