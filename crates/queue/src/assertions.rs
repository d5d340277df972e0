//! Assertion and formatting helpers for captured calls

use crate::queue::QueueHandle;
use mockbus_transport::names::{is_interface_name, is_member_name, is_object_path};
use mockbus_transport::{fill_slots, ArgSlot, MethodInvocation, Value};
use tracing::debug;

/// Renders one captured call for diagnostics
pub fn format_message(invocation: &MethodInvocation) -> String {
    invocation.message().print(0)
}

impl QueueHandle {
    /// Whether `invocation` came from the client connection and targets
    /// `object_path`, `interface_name` and `method_name`
    ///
    /// With `expected_args` set, the argument tuple must also be equal.
    pub fn match_client_message(
        &self,
        invocation: &MethodInvocation,
        object_path: &str,
        interface_name: &str,
        method_name: &str,
        expected_args: Option<&Value>,
    ) -> bool {
        let Some(client) = self.client_connection() else {
            return false;
        };

        invocation.sender() == client.unique_name()
            && invocation.object_path() == object_path
            && invocation.interface_name() == interface_name
            && invocation.method_name() == method_name
            && expected_args.map_or(true, |args| invocation.parameters() == args)
    }

    /// Panics unless the queue is empty
    #[track_caller]
    pub fn assert_no_messages(&self) {
        let n_messages = self.n_messages();
        if n_messages > 0 {
            panic!(
                "Expected no messages, but saw {}:\n{}",
                n_messages,
                self.format_messages()
            );
        }
    }

    /// Pops the next call and checks that it is `interface_name.method_name`
    /// on `object_path`, sent by the client connection
    ///
    /// Blocks like [`pop`](Self::pop). Argument `i` of the call is decoded
    /// into `slots[i]`; a slot that fails to decode is left untouched.
    ///
    /// # Panics
    ///
    /// If the expected path, interface or method name is malformed, if no
    /// call arrives before the queue quits, or if the popped call does not
    /// match.
    #[track_caller]
    pub fn assert_pop_message(
        &self,
        object_path: &str,
        interface_name: &str,
        method_name: &str,
        slots: &mut [&mut dyn ArgSlot],
    ) -> MethodInvocation {
        assert!(is_object_path(object_path), "'{}' is not a valid object path", object_path);
        assert!(
            is_interface_name(interface_name),
            "'{}' is not a valid interface name",
            interface_name
        );
        assert!(is_member_name(method_name), "'{}' is not a valid method name", method_name);

        let Some(invocation) = self.pop() else {
            panic!(
                "Expected message {}.{} from {}, but saw no messages",
                interface_name, method_name, object_path
            );
        };

        if !self.match_client_message(&invocation, object_path, interface_name, method_name, None) {
            let formatted = format_message(&invocation);
            panic!(
                "Expected message {}.{} from {}, but saw: {}",
                interface_name, method_name, object_path, formatted
            );
        }

        for (index, error) in fill_slots(invocation.parameters(), slots) {
            debug!(index, error = %error, "Could not extract message argument");
        }

        invocation
    }
}
