//! Recording signal emissions for later assertions

use crate::hub::{HandlerId, ObjectId, Observable, WeakHub};
use mockbus_transport::{fill_slots, ArgSlot, Value};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// One recorded signal emission
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    object_id: ObjectId,
    type_name: String,
    signal_name: String,
    params: Vec<Value>,
}

impl Emission {
    /// Identity of the emitting object
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The signal name the logger was connected with, including any detail
    pub fn signal_name(&self) -> &str {
        &self.signal_name
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Decodes parameter `i` into `slots[i]`
    ///
    /// Failures are logged at debug level and leave the slot untouched.
    pub fn get_params(&self, slots: &mut [&mut dyn ArgSlot]) {
        let params = Value::Tuple(self.params.clone());
        for (index, error) in fill_slots(&params, slots) {
            debug!(
                index,
                object = %self.object_id,
                signal = %format!("{}::{}", self.type_name, self.signal_name),
                error = %error,
                "Could not extract emission parameter"
            );
        }
    }

    fn is_from(&self, object_id: ObjectId, signal_name: &str) -> bool {
        self.object_id == object_id && self.signal_name == signal_name
    }
}

impl fmt::Display for Emission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} from {} (", self.type_name, self.signal_name, self.object_id)?;
        if self.params.is_empty() {
            f.write_str("no arguments")?;
        }
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", param)?;
        }
        f.write_str(")")
    }
}

type Log = Mutex<VecDeque<Emission>>;

/// Records emissions of the signals it is connected to, oldest first
///
/// The logger does not keep observed objects alive. Dropping it disconnects
/// its handlers from every object that still exists.
///
/// # Examples
///
/// ```rust
/// use mockbus_signal_logger::{Observable, SignalHub, SignalLogger};
///
/// struct Volume {
///     hub: SignalHub,
/// }
///
/// impl Observable for Volume {
///     fn signal_hub(&self) -> &SignalHub {
///         &self.hub
///     }
///
///     fn type_name(&self) -> &str {
///         "Volume"
///     }
/// }
///
/// let volume = Volume { hub: SignalHub::new() };
/// let logger = SignalLogger::new();
/// logger.connect(&volume, "notify");
///
/// volume.notify("level");
/// logger.assert_notify_emission_pop(&volume, "level");
/// logger.assert_no_emissions();
/// ```
pub struct SignalLogger {
    log: Arc<Log>,
    connections: Mutex<Vec<(WeakHub, HandlerId)>>,
}

impl SignalLogger {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(VecDeque::new())),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Starts logging emissions of `signal_name` from `obj`
    ///
    /// `signal_name` may include a detail, as in `notify::level`.
    #[track_caller]
    pub fn connect<O>(&self, obj: &O, signal_name: &str) -> HandlerId
    where
        O: Observable + ?Sized,
    {
        let hub = obj.signal_hub();
        let log: Weak<Log> = Arc::downgrade(&self.log);
        let object_id = hub.object_id();
        let type_name = obj.type_name().to_string();
        let signal = signal_name.to_string();

        let id = hub.connect(signal_name, move |params| {
            let Some(log) = log.upgrade() else {
                return;
            };
            log.lock().push_back(Emission {
                object_id,
                type_name: type_name.clone(),
                signal_name: signal.clone(),
                params: params.to_vec(),
            });
        });

        debug!(object = %object_id, signal = %signal_name, "Logging signal");
        self.connections.lock().push((hub.downgrade(), id));
        id
    }

    /// Number of emissions waiting to be popped
    pub fn n_emissions(&self) -> usize {
        self.log.lock().len()
    }

    /// Removes and returns the oldest emission
    pub fn pop_emission(&self) -> Option<Emission> {
        self.log.lock().pop_front()
    }

    /// Lists the logged emissions, numbered from 1, without removing them
    pub fn format_emissions(&self) -> String {
        let log = self.log.lock();
        let width = log.len().to_string().len();
        log.iter()
            .enumerate()
            .map(|(i, emission)| format!(" {:>width$}. {}", i + 1, emission, width = width))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Panics unless every logged emission has been popped
    #[track_caller]
    pub fn assert_no_emissions(&self) {
        let n_emissions = self.n_emissions();
        if n_emissions > 0 {
            panic!(
                "Expected no signal emissions, but saw {}:\n{}",
                n_emissions,
                self.format_emissions()
            );
        }
    }

    /// Pops the oldest emission and checks it is `signal_name` from `obj`
    ///
    /// Parameters are decoded into `slots` as by [`Emission::get_params`].
    #[track_caller]
    pub fn assert_emission_pop<O>(
        &self,
        obj: &O,
        signal_name: &str,
        slots: &mut [&mut dyn ArgSlot],
    ) -> Emission
    where
        O: Observable + ?Sized,
    {
        let expected = format!("{}::{} from {}", obj.type_name(), signal_name, obj.object_id());
        let Some(emission) = self.pop_emission() else {
            panic!("Expected emission of {}, but saw no emissions", expected);
        };
        if !emission.is_from(obj.object_id(), signal_name) {
            panic!("Expected emission of {}, but saw: {}", expected, emission);
        }

        emission.get_params(slots);
        emission
    }

    /// Pops the oldest emission and checks it notifies a change of `property_name` on `obj`
    ///
    /// Both `notify` and `notify::<property_name>` connections match.
    #[track_caller]
    pub fn assert_notify_emission_pop<O>(&self, obj: &O, property_name: &str)
    where
        O: Observable + ?Sized,
    {
        let expected = format!(
            "{}::notify::{} from {}",
            obj.type_name(),
            property_name,
            obj.object_id()
        );
        let Some(emission) = self.pop_emission() else {
            panic!("Expected emission of {}, but saw no emissions", expected);
        };

        let detailed = format!("notify::{}", property_name);
        if !(emission.is_from(obj.object_id(), "notify") || emission.is_from(obj.object_id(), &detailed)) {
            panic!("Expected emission of {}, but saw: {}", expected, emission);
        }

        let mut notified = String::new();
        emission.get_params(&mut [&mut notified]);
        if notified != property_name {
            panic!(
                "Expected emission of {}, but saw notify::{} instead: {}",
                expected, notified, emission
            );
        }
    }
}

impl Default for SignalLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SignalLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalLogger")
            .field("n_emissions", &self.n_emissions())
            .field("n_connections", &self.connections.lock().len())
            .finish()
    }
}

impl Drop for SignalLogger {
    fn drop(&mut self) {
        for (hub, id) in self.connections.get_mut().drain(..) {
            hub.disconnect(id);
        }
    }
}
