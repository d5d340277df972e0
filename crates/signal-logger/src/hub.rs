//! Signals for observable objects
//!
//! A [`SignalHub`] is embedded in an object that emits signals. Handlers are
//! connected by signal name and run synchronously on the emitting thread.
//! Signal names may carry a detail, as in `notify::volume`: an emission of
//! `notify::volume` reaches handlers connected to `notify` and to
//! `notify::volume`, but not those connected to `notify::mute`.

use mockbus_transport::Value;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Separator between a signal name and its detail
pub const DETAIL_SEPARATOR: &str = "::";

/// Process-unique identity of an observable object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one connected handler; never zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Callback receiving the parameters of one emission
pub type SignalHandler = Arc<dyn Fn(&[Value]) + Send + Sync + 'static>;

struct Connected {
    id: HandlerId,
    signal: String,
    handler: SignalHandler,
}

struct HubInner {
    id: ObjectId,
    handlers: RwLock<Vec<Connected>>,
}

/// Splits `name::detail` into its name and optional detail
pub fn split_detail(signal: &str) -> (&str, Option<&str>) {
    match signal.split_once(DETAIL_SEPARATOR) {
        Some((name, detail)) => (name, Some(detail)),
        None => (signal, None),
    }
}

/// Whether a handler connected to `connected` receives an emission of `emitted`
fn receives(connected: &str, emitted: &str) -> bool {
    match split_detail(connected) {
        (name, None) => split_detail(emitted).0 == name,
        (_, Some(_)) => connected == emitted,
    }
}

/// Signal registry for one observable object
pub struct SignalHub {
    inner: Arc<HubInner>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                id: ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Identity of the object owning this hub
    pub fn object_id(&self) -> ObjectId {
        self.inner.id
    }

    /// Connects `handler` to `signal`, which may include a detail
    ///
    /// # Panics
    ///
    /// If `signal` or its name part is empty.
    #[track_caller]
    pub fn connect<F>(&self, signal: &str, handler: F) -> HandlerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        assert!(
            !split_detail(signal).0.is_empty(),
            "connect() requires a signal name, got '{}'",
            signal
        );
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers.write().push(Connected {
            id,
            signal: signal.to_string(),
            handler: Arc::new(handler),
        });
        id
    }

    /// Disconnects a handler; returns `false` if `id` is not connected here
    pub fn disconnect(&self, id: HandlerId) -> bool {
        disconnect_from(&self.inner, id)
    }

    pub fn n_handlers(&self) -> usize {
        self.inner.handlers.read().len()
    }

    /// Emits `signal` with `params` to every matching handler, in connection order
    ///
    /// Handlers run outside the hub lock, so they may connect or disconnect
    /// handlers themselves.
    pub fn emit(&self, signal: &str, params: &[Value]) {
        let matching: Vec<SignalHandler> = self
            .inner
            .handlers
            .read()
            .iter()
            .filter(|c| receives(&c.signal, signal))
            .map(|c| c.handler.clone())
            .collect();

        trace!(object = %self.inner.id, signal = %signal, handlers = matching.len(), "Emitting signal");
        for handler in matching {
            handler(params);
        }
    }

    pub(crate) fn downgrade(&self) -> WeakHub {
        WeakHub {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHub")
            .field("object_id", &self.inner.id)
            .field("n_handlers", &self.n_handlers())
            .finish()
    }
}

fn disconnect_from(inner: &HubInner, id: HandlerId) -> bool {
    let mut handlers = inner.handlers.write();
    let before = handlers.len();
    handlers.retain(|c| c.id != id);
    handlers.len() != before
}

/// A hub reference that does not keep its object alive
#[derive(Clone)]
pub(crate) struct WeakHub {
    inner: Weak<HubInner>,
}

impl WeakHub {
    /// Disconnects `id` if the hub still exists
    pub(crate) fn disconnect(&self, id: HandlerId) -> bool {
        match self.inner.upgrade() {
            Some(inner) => disconnect_from(&inner, id),
            None => false,
        }
    }
}

/// An object that emits signals through an embedded [`SignalHub`]
pub trait Observable {
    fn signal_hub(&self) -> &SignalHub;

    /// Type name used in diagnostics
    fn type_name(&self) -> &str;

    fn object_id(&self) -> ObjectId {
        self.signal_hub().object_id()
    }

    /// Emits `notify::<property>` with the property name as its only parameter
    fn notify(&self, property: &str) {
        self.signal_hub().emit(
            &format!("notify{}{}", DETAIL_SEPARATOR, property),
            &[Value::from(property)],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_split_detail() {
        assert_eq!(split_detail("notify"), ("notify", None));
        assert_eq!(split_detail("notify::volume"), ("notify", Some("volume")));
    }

    #[test]
    fn test_detail_matching() {
        assert!(receives("notify", "notify"));
        assert!(receives("notify", "notify::volume"));
        assert!(receives("notify::volume", "notify::volume"));
        assert!(!receives("notify::volume", "notify"));
        assert!(!receives("notify::volume", "notify::mute"));
        assert!(!receives("changed", "notify"));
    }

    #[test]
    fn test_emit_reaches_handlers_in_connection_order() {
        let hub = SignalHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            hub.connect("changed", move |params| {
                seen.lock().push((tag, params.to_vec()));
            });
        }
        hub.emit("changed", &[Value::from(5u32)]);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("first", vec![Value::from(5u32)]));
        assert_eq!(seen[1].0, "second");
    }

    #[test]
    fn test_disconnect() {
        let hub = SignalHub::new();
        let id = hub.connect("changed", |_| {});
        assert_eq!(hub.n_handlers(), 1);
        assert!(hub.disconnect(id));
        assert!(!hub.disconnect(id));
        assert_eq!(hub.n_handlers(), 0);
    }

    #[test]
    fn test_handlers_may_disconnect_themselves() {
        let hub = Arc::new(SignalHub::new());
        let id_slot = Arc::new(Mutex::new(None));

        let (weak_hub, slot) = (Arc::downgrade(&hub), id_slot.clone());
        let id = hub.connect("changed", move |_| {
            if let (Some(hub), Some(id)) = (weak_hub.upgrade(), *slot.lock()) {
                hub.disconnect(id);
            }
        });
        *id_slot.lock() = Some(id);

        hub.emit("changed", &[]);
        assert_eq!(hub.n_handlers(), 0);
    }

    #[test]
    fn test_weak_hub_outlives_hub() {
        let hub = SignalHub::new();
        let id = hub.connect("changed", |_| {});
        let weak = hub.downgrade();
        assert!(weak.disconnect(id));

        let id = hub.connect("changed", |_| {});
        drop(hub);
        assert!(!weak.disconnect(id));
    }

    #[test]
    fn test_object_ids_are_unique() {
        assert_ne!(SignalHub::new().object_id(), SignalHub::new().object_id());
    }

    #[test]
    #[should_panic(expected = "requires a signal name")]
    fn test_connect_requires_a_name() {
        SignalHub::new().connect("::detail", |_| {});
    }
}
