//! In-process private message bus
//!
//! [`PrivateBus`] plays the role of a session bus daemon for a single test.
//! A router thread owns the name registry and forwards every message in the
//! order it arrived on a single unbounded inbox. Connections find the bus
//! through an opaque address registered in a process-wide table.

use crate::connection::ConnectionInner;
use crate::message::{error_names, Message, MessageType, BUS_NAME};
use crate::value::Value;
use mockbus_shared::{MockBusError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

/// Reply to a name ownership request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    AlreadyOwner,
}

/// Reply to a name release request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

pub(crate) enum BusCommand {
    Attach {
        unique_name: String,
        connection: Weak<ConnectionInner>,
    },
    Detach {
        unique_name: String,
    },
    Send {
        message: Message,
    },
    RequestName {
        unique_name: String,
        name: String,
        reply: oneshot::Sender<RequestNameReply>,
    },
    ReleaseName {
        unique_name: String,
        name: String,
        reply: oneshot::Sender<ReleaseNameReply>,
    },
    Shutdown,
}

/// State shared between the bus handle and the connections attached to it
pub(crate) struct BusCore {
    address: String,
    inbox: mpsc::UnboundedSender<BusCommand>,
    next_unique: AtomicU32,
}

impl BusCore {
    pub(crate) fn inbox(&self) -> mpsc::UnboundedSender<BusCommand> {
        self.inbox.clone()
    }

    pub(crate) fn allocate_unique_name(&self) -> String {
        format!(":1.{}", self.next_unique.fetch_add(1, Ordering::Relaxed))
    }
}

static ADDRESS_TABLE: LazyLock<Mutex<HashMap<String, Weak<BusCore>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Resolves a bus address to a running bus
pub(crate) fn lookup_address(address: &str) -> Result<Arc<BusCore>> {
    ADDRESS_TABLE
        .lock()
        .get(address)
        .and_then(Weak::upgrade)
        .ok_or_else(|| MockBusError::transport(format!("no bus is running at '{}'", address), None))
}

struct Running {
    core: Arc<BusCore>,
    router: JoinHandle<()>,
}

/// A private bus for one test
///
/// The bus starts down. [`up`](Self::up) spawns the router and publishes the
/// address; [`down`](Self::down) disconnects every client and joins the
/// router. Dropping a bus that is still up takes it down.
#[derive(Default)]
pub struct PrivateBus {
    running: Option<Running>,
}

impl PrivateBus {
    pub fn new() -> Self {
        Self { running: None }
    }

    pub fn is_up(&self) -> bool {
        self.running.is_some()
    }

    /// Address to pass to [`Connection::open`](crate::Connection::open), if the bus is up
    pub fn address(&self) -> Option<&str> {
        self.running.as_ref().map(|r| r.core.address.as_str())
    }

    /// Starts the router thread and registers the bus address
    #[instrument(skip(self))]
    pub fn up(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(MockBusError::invalid_argument("bus is already up"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let address = format!("mockbus:guid={}", uuid::Uuid::new_v4().simple());
        let core = Arc::new(BusCore {
            address: address.clone(),
            inbox: tx,
            next_unique: AtomicU32::new(1),
        });

        let router = thread::Builder::new()
            .name("mockbus-daemon".to_string())
            .spawn(move || Router::default().run(rx))
            .map_err(|e| {
                MockBusError::transport("failed to spawn the bus router thread", Some(Box::new(e)))
            })?;

        ADDRESS_TABLE
            .lock()
            .insert(address.clone(), Arc::downgrade(&core));
        info!(address = %address, "Private bus up");

        self.running = Some(Running { core, router });
        Ok(())
    }

    /// Closes every connection, unregisters the address and joins the router
    ///
    /// Does nothing if the bus is not up.
    #[instrument(skip(self))]
    pub fn down(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        ADDRESS_TABLE.lock().remove(&running.core.address);
        let _ = running.core.inbox.send(BusCommand::Shutdown);
        if running.router.join().is_err() {
            warn!(address = %running.core.address, "Bus router thread panicked");
        }
        info!(address = %running.core.address, "Private bus down");
    }
}

impl Drop for PrivateBus {
    fn drop(&mut self) {
        self.down();
    }
}

/// Router-side bookkeeping; lives on the router thread only
#[derive(Default)]
struct Router {
    connections: HashMap<String, Weak<ConnectionInner>>,
    /// Well-known name to owners; the front is the primary owner
    names: HashMap<String, VecDeque<String>>,
    /// (caller, serial) to callee for calls still waiting for a reply
    in_flight: HashMap<(String, u32), String>,
}

impl Router {
    fn run(mut self, mut inbox: mpsc::UnboundedReceiver<BusCommand>) {
        while let Some(command) = inbox.blocking_recv() {
            match command {
                BusCommand::Attach {
                    unique_name,
                    connection,
                } => {
                    debug!(unique_name = %unique_name, "Connection attached");
                    self.connections.insert(unique_name, connection);
                }
                BusCommand::Detach { unique_name } => self.detach(&unique_name),
                BusCommand::Send { message } => self.route(message),
                BusCommand::RequestName {
                    unique_name,
                    name,
                    reply,
                } => {
                    let _ = reply.send(self.request_name(&unique_name, &name));
                }
                BusCommand::ReleaseName {
                    unique_name,
                    name,
                    reply,
                } => {
                    let _ = reply.send(self.release_name(&unique_name, &name));
                }
                BusCommand::Shutdown => break,
            }
        }

        for connection in self.connections.values().filter_map(Weak::upgrade) {
            connection.close_from_bus();
        }
    }

    fn detach(&mut self, unique_name: &str) {
        if self.connections.remove(unique_name).is_none() {
            return;
        }
        debug!(unique_name = %unique_name, "Connection detached");

        let owned: Vec<String> = self
            .names
            .iter()
            .filter(|(_, owners)| owners.iter().any(|o| o == unique_name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.release_name(unique_name, &name);
        }

        let orphaned: Vec<(String, u32)> = self
            .in_flight
            .iter()
            .filter(|(_, callee)| callee.as_str() == unique_name)
            .map(|(key, _)| key.clone())
            .collect();
        for (caller, serial) in orphaned {
            self.in_flight.remove(&(caller.clone(), serial));
            let mut reply = Message::error_for(
                &caller,
                serial,
                error_names::NO_REPLY,
                "Remote peer disconnected before replying",
            );
            reply.sender = Some(unique_name.to_string());
            self.deliver(&caller, reply);
        }

        self.in_flight.retain(|(caller, _), _| caller != unique_name);
    }

    fn request_name(&mut self, unique_name: &str, name: &str) -> RequestNameReply {
        let owners = self.names.entry(name.to_string()).or_default();
        let reply = match owners.iter().position(|o| o == unique_name) {
            Some(0) => RequestNameReply::AlreadyOwner,
            Some(_) => RequestNameReply::InQueue,
            None if owners.is_empty() => {
                owners.push_back(unique_name.to_string());
                RequestNameReply::PrimaryOwner
            }
            None => {
                owners.push_back(unique_name.to_string());
                RequestNameReply::InQueue
            }
        };
        debug!(name = %name, owner = %unique_name, reply = ?reply, "Name requested");
        reply
    }

    fn release_name(&mut self, unique_name: &str, name: &str) -> ReleaseNameReply {
        let Some(owners) = self.names.get_mut(name) else {
            return ReleaseNameReply::NonExistent;
        };
        let Some(position) = owners.iter().position(|o| o == unique_name) else {
            return ReleaseNameReply::NotOwner;
        };

        owners.remove(position);
        if position == 0 {
            match owners.front() {
                Some(next) => debug!(name = %name, owner = %next, "Name ownership passed on"),
                None => debug!(name = %name, "Name released"),
            }
        }
        if owners.is_empty() {
            self.names.remove(name);
        }
        ReleaseNameReply::Released
    }

    fn resolve(&self, destination: &str) -> Option<String> {
        if destination.starts_with(':') {
            self.connections
                .contains_key(destination)
                .then(|| destination.to_string())
        } else {
            self.names
                .get(destination)
                .and_then(|owners| owners.front().cloned())
        }
    }

    fn deliver(&self, unique_name: &str, message: Message) {
        match self.connections.get(unique_name).and_then(Weak::upgrade) {
            Some(connection) => connection.deliver(message),
            None => debug!(destination = %unique_name, serial = message.serial, "Dropping message for vanished connection"),
        }
    }

    fn reply_error(&self, call: &Message, error_name: &str, text: &str) {
        if !call.expects_reply() {
            return;
        }
        let Some(caller) = call.sender.clone() else {
            return;
        };
        let mut reply = Message::error(call, error_name, text);
        reply.sender = Some(BUS_NAME.to_string());
        self.deliver(&caller, reply);
    }

    fn route(&mut self, message: Message) {
        let Some(sender) = message.sender.clone() else {
            warn!(serial = message.serial, "Dropping message without a sender");
            return;
        };

        match message.message_type {
            MessageType::MethodReturn | MessageType::Error => {
                let Some(destination) = message.destination.clone() else {
                    return;
                };
                if let Some(serial) = message.reply_serial {
                    self.in_flight.remove(&(destination.clone(), serial));
                }
                self.deliver(&destination, message);
            }
            MessageType::Signal => match message.destination.clone() {
                Some(destination) => {
                    if let Some(target) = self.resolve(&destination) {
                        self.deliver(&target, message);
                    }
                }
                None => {
                    for connection in self.connections.values().filter_map(Weak::upgrade) {
                        if connection.unique_name() != sender {
                            connection.deliver(message.clone());
                        }
                    }
                }
            },
            MessageType::MethodCall => {
                let Some(destination) = message.destination.clone() else {
                    self.reply_error(
                        &message,
                        error_names::SERVICE_UNKNOWN,
                        "Method call has no destination",
                    );
                    return;
                };

                if destination == BUS_NAME {
                    self.handle_bus_call(&message);
                    return;
                }

                match self.resolve(&destination) {
                    Some(target) => {
                        if message.expects_reply() {
                            self.in_flight
                                .insert((sender, message.serial), target.clone());
                        }
                        self.deliver(&target, message);
                    }
                    None => self.reply_error(
                        &message,
                        error_names::SERVICE_UNKNOWN,
                        &format!(
                            "The name {} was not provided by any .service files",
                            destination
                        ),
                    ),
                }
            }
        }
    }

    /// Answers the small subset of the `org.freedesktop.DBus` interface that tests use
    fn handle_bus_call(&self, call: &Message) {
        let arg0 = match call.body.child(0) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        };

        let body = match (call.member.as_deref(), arg0) {
            (Some("GetNameOwner"), Some(name)) => match self.resolve(name) {
                Some(owner) => Value::from((owner,)),
                None => {
                    self.reply_error(
                        call,
                        error_names::NAME_HAS_NO_OWNER,
                        &format!("Could not get owner of name '{}': no such name", name),
                    );
                    return;
                }
            },
            (Some("NameHasOwner"), Some(name)) => Value::from((self.resolve(name).is_some(),)),
            (Some("ListNames"), None) => {
                let mut names: Vec<String> = vec![BUS_NAME.to_string()];
                names.extend(self.connections.keys().cloned());
                names.extend(self.names.keys().cloned());
                names.sort();
                Value::from((names,))
            }
            (member, _) => {
                self.reply_error(
                    call,
                    error_names::UNKNOWN_METHOD,
                    &format!("No such method '{}'", member.unwrap_or_default()),
                );
                return;
            }
        };

        if let Some(caller) = call.sender.clone() {
            if call.expects_reply() {
                let mut reply = Message::method_return(call, body);
                reply.sender = Some(BUS_NAME.to_string());
                self.deliver(&caller, reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_and_down() {
        let mut bus = PrivateBus::new();
        assert!(!bus.is_up());
        assert!(bus.address().is_none());

        bus.up().unwrap();
        let address = bus.address().unwrap().to_string();
        assert!(address.starts_with("mockbus:guid="));
        assert!(lookup_address(&address).is_ok());
        assert!(bus.up().is_err());

        bus.down();
        assert!(!bus.is_up());
        assert!(matches!(
            lookup_address(&address),
            Err(MockBusError::Transport { .. })
        ));

        // Down twice is fine.
        bus.down();
    }

    #[test]
    fn test_addresses_are_unique() {
        let mut a = PrivateBus::new();
        let mut b = PrivateBus::new();
        a.up().unwrap();
        b.up().unwrap();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_name_queue() {
        let mut router = Router::default();
        assert_eq!(router.request_name(":1.1", "com.example.Test"), RequestNameReply::PrimaryOwner);
        assert_eq!(router.request_name(":1.1", "com.example.Test"), RequestNameReply::AlreadyOwner);
        assert_eq!(router.request_name(":1.2", "com.example.Test"), RequestNameReply::InQueue);
        assert_eq!(router.resolve("com.example.Test").as_deref(), Some(":1.1"));

        assert_eq!(router.release_name(":1.3", "com.example.Test"), ReleaseNameReply::NotOwner);
        assert_eq!(router.release_name(":1.1", "com.example.Other"), ReleaseNameReply::NonExistent);
        assert_eq!(router.release_name(":1.1", "com.example.Test"), ReleaseNameReply::Released);
        assert_eq!(router.resolve("com.example.Test").as_deref(), Some(":1.2"));

        assert_eq!(router.release_name(":1.2", "com.example.Test"), ReleaseNameReply::Released);
        assert!(router.resolve("com.example.Test").is_none());
    }
}
