//! # Mockbus Transport
//!
//! An in-process stand-in for a D-Bus session bus, sized for unit tests.
//!
//! ## Features
//!
//! - **Private bus**: [`PrivateBus`] runs a router thread with a name registry,
//!   reachable through an opaque address
//! - **Connections**: blocking and callback-based method calls, name
//!   ownership, object export and message filters
//! - **Typed values**: [`Value`] covers the D-Bus type system and renders in a
//!   readable text form
//! - **Main contexts**: cooperative per-thread task queues that decide where
//!   handlers and callbacks run
//!
//! ## Design Principles
//!
//! - **Arrival order**: the router has one FIFO inbox, so messages are
//!   delivered in the order they were sent
//! - **No lost callers**: unanswered calls always end in a reply, an error
//!   reply or a timeout

pub mod bus;
pub mod connection;
pub mod interface;
pub mod invocation;
pub mod main_context;
pub mod message;
pub mod names;
pub mod value;

// Re-export commonly used types for convenience
pub use bus::{PrivateBus, ReleaseNameReply, RequestNameReply};
pub use connection::{
    properties_interface, Call, Connection, FilterDirection, MethodHandler, DEFAULT_CALL_TIMEOUT,
    PROPERTIES_INTERFACE,
};
pub use interface::{ArgInfo, InterfaceInfo, MethodInfo, PropertyAccess, PropertyInfo, SignalInfo};
pub use invocation::MethodInvocation;
pub use main_context::{MainContext, ThreadDefaultGuard};
pub use message::{error_names, Message, MessageType, BUS_NAME};
pub use names::ObjectPath;
pub use value::{fill_slots, ArgSlot, FromValue, Ignore, StaticType, Value};
