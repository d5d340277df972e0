//! Server thread runtime
//!
//! The server thread makes the private server context its thread default and
//! moves through four states:
//!
//! - `Idle`: iterate until a server function is set or the queue quits;
//!   a function set before quitting still runs
//! - `Running`: call the server function once
//! - `Draining`: iterate until the queue quits
//! - `Quitting`: run whatever is still ready, then exit
//!
//! Method calls on exported objects are dispatched on this thread and pushed
//! onto the queue, never answered here.

use crate::queue::{QueueHandle, Shared};
use mockbus_transport::{FilterDirection, Message, MethodInvocation};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Draining,
    Quitting,
}

/// Entry point of the server thread
pub(crate) fn run(handle: QueueHandle) {
    let shared = handle.shared.clone();
    *shared.server_thread_id.lock() = Some(thread::current().id());
    let context = shared.server_context.clone();
    let _guard = context.push_thread_default();

    let mut state = State::Idle;
    loop {
        state = match state {
            State::Idle => {
                if shared.server_func.lock().is_some() {
                    State::Running
                } else if handle.is_quitting() {
                    State::Draining
                } else {
                    context.iteration(true);
                    State::Idle
                }
            }
            State::Running => {
                let func = shared.server_func.lock().take();
                if let Some(func) = func {
                    debug!("Running server function");
                    let result = panic::catch_unwind(AssertUnwindSafe(|| func(&handle)));
                    if let Err(payload) = result {
                        error!(
                            panic = %panic_message(payload.as_ref()),
                            "Server function panicked"
                        );
                        shared.server_panic.lock().get_or_insert(payload);
                        if let Some(server) = handle.server_connection() {
                            server.close();
                        }
                    }
                }
                State::Draining
            }
            State::Draining => {
                if handle.is_quitting() {
                    State::Quitting
                } else {
                    context.iteration(true);
                    State::Draining
                }
            }
            State::Quitting => {
                while context.iteration(false) {}
                break;
            }
        };
    }
    debug!("Server thread exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Handler installed on every exported object
pub(crate) fn dispatch(shared: &Weak<Shared>, invocation: MethodInvocation) {
    // A handler outliving its queue drops the call, which answers NoReply.
    let Some(shared) = shared.upgrade() else {
        return;
    };
    enqueue(&shared, invocation);
}

pub(crate) fn enqueue(shared: &Arc<Shared>, invocation: MethodInvocation) {
    debug!(
        serial = invocation.message().serial,
        path = %invocation.object_path(),
        interface = %invocation.interface_name(),
        method = %invocation.method_name(),
        "Queueing method call"
    );
    shared.messages.lock().push_back(invocation);
    shared.server_context.wakeup();
    shared.client_context.wakeup();
}

/// Filter that dumps every message the server connection sees
pub(crate) fn debug_filter(indent: usize) -> impl Fn(&Message, FilterDirection) + Send + Sync + 'static {
    move |message, direction| {
        let arrow = match direction {
            FilterDirection::Incoming => "←",
            FilterDirection::Outgoing => "→",
        };
        debug!("Server {} Code Under Test\n{}", arrow, message.print(indent));
    }
}
