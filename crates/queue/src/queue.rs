//! The mock service queue
//!
//! [`DBusQueue`] owns a private bus, a server connection serviced by a
//! dedicated server thread, and a client connection for the code under test.
//! Every method call that reaches an object exported through the queue is
//! captured as a [`MethodInvocation`] and appended to a FIFO, from which the
//! test pops calls, checks them and replies.
//!
//! [`QueueHandle`] is the thread-safe part of the queue. `DBusQueue`
//! dereferences to it, and the server function receives one, so popping,
//! asserting and registering work the same from the test thread and the
//! server thread. Bootstrap and teardown (`connect`/`disconnect`) stay on
//! `DBusQueue` and must run on the constructing thread.

use crate::config::QueueConfig;
use crate::server;
use mockbus_shared::{MockBusError, Result};
use mockbus_transport::names::{is_object_path, is_well_known_name};
use mockbus_transport::{Connection, InterfaceInfo, MainContext, MethodInvocation, PrivateBus};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

/// Callback that drives the mock service; runs once on the server thread
pub type ServerFunc = Box<dyn FnOnce(&QueueHandle) + Send + 'static>;

#[derive(Default)]
pub(crate) struct OwnedIds {
    pub(crate) names: Vec<u32>,
    pub(crate) objects: Vec<u32>,
}

pub(crate) struct Shared {
    pub(crate) config: QueueConfig,
    pub(crate) server_context: MainContext,
    pub(crate) client_context: MainContext,
    pub(crate) client_connection: RwLock<Option<Connection>>,
    pub(crate) server_connection: RwLock<Option<Connection>>,
    pub(crate) owned: Mutex<OwnedIds>,
    pub(crate) messages: Mutex<VecDeque<MethodInvocation>>,
    pub(crate) server_func: Mutex<Option<ServerFunc>>,
    pub(crate) server_func_set: AtomicBool,
    pub(crate) connected: AtomicBool,
    pub(crate) quitting: AtomicBool,
    pub(crate) server_thread_id: Mutex<Option<ThreadId>>,
    pub(crate) server_panic: Mutex<Option<Box<dyn Any + Send + 'static>>>,
}

/// Thread-safe view of a [`DBusQueue`]
#[derive(Clone)]
pub struct QueueHandle {
    pub(crate) shared: Arc<Shared>,
}

impl QueueHandle {
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Whether `connect` has succeeded and `disconnect` has not completed
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub(crate) fn is_quitting(&self) -> bool {
        self.shared.quitting.load(Ordering::Acquire)
    }

    /// Connection to hand to the code under test
    ///
    /// `None` before `connect` and after `disconnect`.
    pub fn client_connection(&self) -> Option<Connection> {
        self.shared.client_connection.read().clone()
    }

    pub(crate) fn server_connection(&self) -> Option<Connection> {
        self.shared.server_connection.read().clone()
    }

    fn is_server_thread(&self) -> bool {
        *self.shared.server_thread_id.lock() == Some(thread::current().id())
    }

    #[track_caller]
    pub(crate) fn assert_connected(&self, operation: &str) {
        assert!(
            self.is_connected(),
            "{}() called on a queue which is not connected",
            operation
        );
    }

    /// Sets the function which drives the mock service
    ///
    /// It runs once on the server thread, after `connect`, and typically pops
    /// and answers the calls the test expects. It may consume what it
    /// captures. Panics raised inside it are re-raised by `disconnect`.
    ///
    /// # Panics
    ///
    /// If a server function has already been set.
    #[track_caller]
    pub fn set_server_func<F>(&self, func: F)
    where
        F: FnOnce(&QueueHandle) + Send + 'static,
    {
        // The slot is emptied when the function runs, so the flag remembers it was set.
        if self.shared.server_func_set.swap(true, Ordering::AcqRel) {
            panic!("set_server_func() called on a queue which already has a server function");
        }
        *self.shared.server_func.lock() = Some(Box::new(func));
        self.shared.server_context.wakeup();
    }

    /// Runs `work` on the server thread and waits for its result
    ///
    /// When already on the server thread the work runs inline, since posting
    /// it would wait on ourselves.
    fn run_on_server<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_server_thread() {
            return Ok(work());
        }

        let (tx, rx) = oneshot::channel();
        self.shared.server_context.invoke(move || {
            let _ = tx.send(work());
        });
        Ok(rx.blocking_recv()?)
    }

    #[track_caller]
    fn expect_server_connection(&self, operation: &str) -> Connection {
        match self.server_connection() {
            Some(connection) => connection,
            None => panic!("{}() called on a queue without a server connection", operation),
        }
    }

    /// Owns the well-known bus name `name` on the server connection
    ///
    /// Callable from any thread after `connect`. Returns a non-zero ID for
    /// [`unown_name`](Self::unown_name).
    ///
    /// # Panics
    ///
    /// If the queue is not connected, if `name` is not a valid well-known
    /// name, or if the bus refuses the request.
    #[track_caller]
    pub fn own_name(&self, name: &str) -> u32 {
        self.assert_connected("own_name");
        assert!(
            is_well_known_name(name),
            "own_name() requires a well-known bus name, got '{}'",
            name
        );

        let connection = self.expect_server_connection("own_name");
        let requested = name.to_string();
        debug!(name = %name, "Owning name");
        let id = match self
            .run_on_server(move || connection.own_name(&requested))
            .and_then(|result| result)
        {
            Ok(id) => id,
            Err(e) => panic!("Failed to own name '{}': {}", name, e),
        };

        self.shared.owned.lock().names.push(id);
        id
    }

    /// Releases a name owned through [`own_name`](Self::own_name)
    ///
    /// # Panics
    ///
    /// If `id` is zero or is not currently owned through this queue.
    #[track_caller]
    pub fn unown_name(&self, id: u32) {
        self.assert_connected("unown_name");
        assert_ne!(id, 0, "unown_name() called with ID 0");

        let removed = {
            let mut owned = self.shared.owned.lock();
            match owned.names.iter().position(|&owned_id| owned_id == id) {
                Some(index) => {
                    owned.names.swap_remove(index);
                    true
                }
                None => false,
            }
        };
        assert!(removed, "unown_name() called with unknown name ID {}", id);

        if let Some(connection) = self.server_connection() {
            connection.unown_name(id);
        }
    }

    /// Exports an object implementing `interface` at `path`
    ///
    /// Every call on it is captured in the queue. Callable from any thread
    /// after `connect`; the registration itself happens on the server thread.
    ///
    /// # Panics
    ///
    /// If the queue is not connected or `path` is not a valid object path.
    #[track_caller]
    pub fn export_object(&self, path: &str, interface: &InterfaceInfo) -> Result<u32> {
        self.assert_connected("export_object");
        assert!(
            is_object_path(path),
            "export_object() requires a valid object path, got '{}'",
            path
        );

        let connection = self.expect_server_connection("export_object");
        let shared = Arc::downgrade(&self.shared);
        let interface = interface.clone();
        let object_path = path.to_string();
        debug!(path = %path, interface = %interface.name, "Exporting object");

        let id = self.run_on_server(move || {
            connection.register_object(&object_path, &interface, move |invocation| {
                server::dispatch(&shared, invocation)
            })
        })??;

        self.shared.owned.lock().objects.push(id);
        Ok(id)
    }

    /// Removes an object exported through [`export_object`](Self::export_object)
    ///
    /// # Panics
    ///
    /// If `id` is zero or is not currently exported through this queue.
    #[track_caller]
    pub fn unexport_object(&self, id: u32) {
        self.assert_connected("unexport_object");
        assert_ne!(id, 0, "unexport_object() called with ID 0");

        let removed = {
            let mut owned = self.shared.owned.lock();
            match owned.objects.iter().position(|&owned_id| owned_id == id) {
                Some(index) => {
                    owned.objects.swap_remove(index);
                    true
                }
                None => false,
            }
        };
        assert!(removed, "unexport_object() called with unknown object ID {}", id);

        if let Some(connection) = self.server_connection() {
            connection.unregister_object(id);
        }
    }
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("connected", &self.is_connected())
            .field("n_messages", &self.n_messages())
            .finish()
    }
}

/// A mock service for unit tests, reachable over a private bus
///
/// # Examples
///
/// ```rust
/// use mockbus_queue::DBusQueue;
///
/// let mut queue = DBusQueue::new();
/// queue.connect().unwrap();
/// let client = queue.client_connection().unwrap();
/// assert!(client.unique_name().starts_with(':'));
/// queue.disconnect(true);
/// ```
pub struct DBusQueue {
    handle: QueueHandle,
    bus: PrivateBus,
    server_thread: Option<JoinHandle<()>>,
    filter_id: Option<u32>,
    owner: ThreadId,
}

impl DBusQueue {
    /// Creates a disconnected queue with the default configuration
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Creates a disconnected queue
    ///
    /// The calling thread's default [`MainContext`] becomes the client
    /// context, which [`pop`](QueueHandle::pop) iterates on this thread.
    ///
    /// # Panics
    ///
    /// If `config` does not validate.
    #[track_caller]
    pub fn with_config(config: QueueConfig) -> Self {
        if let Err(e) = config.validate() {
            panic!("Invalid queue configuration: {}", e);
        }
        if let Some(level) = config.log_level() {
            if !mockbus_shared::init_logging(level) {
                debug!(level = %level, "Subscriber already installed, keeping it");
            }
        }

        let shared = Shared {
            config,
            server_context: MainContext::new(),
            client_context: MainContext::ref_thread_default(),
            client_connection: RwLock::new(None),
            server_connection: RwLock::new(None),
            owned: Mutex::new(OwnedIds::default()),
            messages: Mutex::new(VecDeque::new()),
            server_func: Mutex::new(None),
            server_func_set: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
            server_thread_id: Mutex::new(None),
            server_panic: Mutex::new(None),
        };

        Self {
            handle: QueueHandle {
                shared: Arc::new(shared),
            },
            bus: PrivateBus::new(),
            server_thread: None,
            filter_id: None,
            owner: thread::current().id(),
        }
    }

    /// Address of the private bus, while connected
    ///
    /// Further connections opened on it reach the exported objects too, but
    /// their calls do not match [`assert_pop_message`](QueueHandle::assert_pop_message).
    pub fn bus_address(&self) -> Option<&str> {
        self.bus.address()
    }

    /// The thread-safe handle, for moving into other threads
    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Brings up the private bus, opens both connections and starts the server thread
    ///
    /// # Panics
    ///
    /// If the queue is already connected or this is not the constructing thread.
    #[track_caller]
    #[instrument(skip(self))]
    pub fn connect(&mut self) -> Result<()> {
        assert!(
            self.server_thread.is_none(),
            "connect() called on a queue which is already connected"
        );
        assert_eq!(
            thread::current().id(),
            self.owner,
            "connect() must be called from the thread which created the queue"
        );

        if let Err(e) = self.try_connect() {
            warn!(error = %e, "Failed to connect queue");
            self.reset_connections();
            self.bus.down();
            return Err(e);
        }
        Ok(())
    }

    fn try_connect(&mut self) -> Result<()> {
        let shared = self.handle.shared.clone();

        self.bus.up()?;
        let address = self
            .bus
            .address()
            .ok_or_else(|| MockBusError::transport("private bus has no address", None))?
            .to_string();

        let client = {
            let _guard = shared.client_context.push_thread_default();
            Connection::open(&address)?
        };
        client.set_default_timeout(shared.config.default_call_timeout());
        *shared.client_connection.write() = Some(client);

        let server = {
            let _guard = shared.server_context.push_thread_default();
            Connection::open(&address)?
        };
        if shared.config.install_debug_filter {
            self.filter_id = Some(server.add_filter(server::debug_filter(
                shared.config.message_print_indent,
            )));
        }
        *shared.server_connection.write() = Some(server);

        shared.quitting.store(false, Ordering::Release);
        shared.connected.store(true, Ordering::Release);

        let handle = self.handle.clone();
        let server_thread = thread::Builder::new()
            .name(shared.config.server_thread_name.clone())
            .spawn(move || server::run(handle))
            .map_err(|e| {
                shared.connected.store(false, Ordering::Release);
                MockBusError::transport("failed to spawn the server thread", Some(Box::new(e)))
            })?;
        *shared.server_thread_id.lock() = Some(server_thread.thread().id());
        self.server_thread = Some(server_thread);

        info!(address = %address, "Queue connected");
        Ok(())
    }

    fn reset_connections(&mut self) {
        let shared = &self.handle.shared;
        if let Some(client) = shared.client_connection.write().take() {
            client.close();
        }
        if let Some(server) = shared.server_connection.write().take() {
            server.close();
        }
        self.filter_id = None;
    }

    /// Tears down the mock service
    ///
    /// With `assert_queue_empty` set, first asserts that every captured call
    /// was popped. Calls still queued afterwards are answered with
    /// `org.freedesktop.DBus.Error.NoReply`. If the server function
    /// panicked, the panic is re-raised here.
    ///
    /// # Panics
    ///
    /// If the queue is not connected, if this is not the constructing
    /// thread, or if `assert_queue_empty` is set and calls are pending.
    #[track_caller]
    pub fn disconnect(&mut self, assert_queue_empty: bool) {
        assert!(
            self.server_thread.is_some(),
            "disconnect() called on a queue which is not connected"
        );
        assert_eq!(
            thread::current().id(),
            self.owner,
            "disconnect() must be called from the thread which created the queue"
        );

        if assert_queue_empty {
            self.assert_no_messages();
        }

        self.teardown();

        let server_panic = self.handle.shared.server_panic.lock().take();
        if let Some(payload) = server_panic {
            if !thread::panicking() {
                panic::resume_unwind(payload);
            }
        }
    }

    #[instrument(skip(self))]
    fn teardown(&mut self) {
        let shared = self.handle.shared.clone();

        if let Some(client) = shared.client_connection.write().take() {
            client.close();
        }

        let (names, objects) = {
            let mut owned = shared.owned.lock();
            (
                std::mem::take(&mut owned.names),
                std::mem::take(&mut owned.objects),
            )
        };
        if let Some(server) = self.handle.server_connection() {
            for id in names {
                server.unown_name(id);
            }
            for id in objects {
                server.unregister_object(id);
            }
            if let Some(filter_id) = self.filter_id.take() {
                server.remove_filter(filter_id);
            }
        }

        if let Some(server) = shared.server_connection.write().take() {
            server.close();
        }
        self.bus.down();

        shared.quitting.store(true, Ordering::Release);
        shared.server_context.wakeup();
        if let Some(server_thread) = self.server_thread.take() {
            if let Err(payload) = server_thread.join() {
                shared.server_panic.lock().get_or_insert(payload);
            }
        }
        *shared.server_thread_id.lock() = None;
        shared.connected.store(false, Ordering::Release);

        let remaining: Vec<MethodInvocation> = shared.messages.lock().drain(..).collect();
        if !remaining.is_empty() {
            debug!(count = remaining.len(), "Dropping unpopped messages");
        }
        drop(remaining);

        info!("Queue disconnected");
    }
}

impl Default for DBusQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for DBusQueue {
    type Target = QueueHandle;

    fn deref(&self) -> &QueueHandle {
        &self.handle
    }
}

impl fmt::Debug for DBusQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DBusQueue")
            .field("connected", &self.is_connected())
            .field("bus_address", &self.bus.address())
            .field("n_messages", &self.n_messages())
            .finish()
    }
}

impl Drop for DBusQueue {
    fn drop(&mut self) {
        if self.server_thread.is_none() {
            return;
        }
        if thread::panicking() {
            // Already failing; tear down quietly without further assertions.
            self.teardown();
        } else {
            self.disconnect(true);
        }
    }
}
