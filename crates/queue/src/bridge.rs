//! Popping captured calls off the queue

use crate::queue::QueueHandle;
use mockbus_transport::{MainContext, MethodInvocation};
use tracing::debug;

impl QueueHandle {
    /// Number of calls waiting to be popped
    pub fn n_messages(&self) -> usize {
        self.shared.messages.lock().len()
    }

    /// Pops the oldest call without blocking
    ///
    /// # Panics
    ///
    /// If the queue is not connected.
    #[track_caller]
    pub fn try_pop(&self) -> Option<MethodInvocation> {
        self.assert_connected("try_pop");
        self.pop_front()
    }

    fn pop_front(&self) -> Option<MethodInvocation> {
        let invocation = self.shared.messages.lock().pop_front()?;
        debug!(
            serial = invocation.message().serial,
            method = %invocation.method_name(),
            "Popped method call"
        );
        Some(invocation)
    }

    /// Pops the oldest call, iterating the calling thread's default main
    /// context until one arrives
    ///
    /// Returns `None` once the queue starts disconnecting, so a server
    /// function blocked here is released by `disconnect`. The queue stays
    /// connected until the server thread has exited.
    ///
    /// # Panics
    ///
    /// If the queue is not connected.
    #[track_caller]
    pub fn pop(&self) -> Option<MethodInvocation> {
        self.assert_connected("pop");

        let context = MainContext::ref_thread_default();
        loop {
            if let Some(invocation) = self.pop_front() {
                return Some(invocation);
            }
            if self.is_quitting() {
                return None;
            }
            context.iteration(true);
        }
    }

    /// Renders every queued call, oldest first, without removing any
    pub fn format_messages(&self) -> String {
        let messages = self.shared.messages.lock();
        messages
            .iter()
            .map(crate::assertions::format_message)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
