//! Incoming method calls awaiting a reply

use crate::connection::Connection;
use crate::interface::MethodInfo;
use crate::message::{error_names, Message};
use crate::names::is_error_name;
use crate::value::Value;
use mockbus_shared::MockBusError;
use std::fmt;
use tracing::warn;

/// The capability to answer one call
struct ReplyHandle {
    connection: Connection,
}

impl ReplyHandle {
    fn send(self, reply: Message) {
        self.connection.inner().send_reply(reply);
    }
}

enum ReplyState {
    Unreplied(ReplyHandle),
    Replied,
}

/// One method call received by an exported object
///
/// Replying consumes the invocation, so a call can be answered at most once.
/// Dropping an invocation without replying answers the caller with
/// `org.freedesktop.DBus.Error.NoReply` and logs a warning.
pub struct MethodInvocation {
    message: Message,
    method_info: Option<MethodInfo>,
    connection: Connection,
    state: ReplyState,
}

impl MethodInvocation {
    pub(crate) fn new(connection: Connection, message: Message, method_info: Option<MethodInfo>) -> Self {
        let state = if message.expects_reply() {
            ReplyState::Unreplied(ReplyHandle {
                connection: connection.clone(),
            })
        } else {
            ReplyState::Replied
        };
        Self {
            message,
            method_info,
            connection,
            state,
        }
    }

    /// Unique name of the calling connection
    pub fn sender(&self) -> &str {
        self.message.sender.as_deref().unwrap_or_default()
    }

    pub fn object_path(&self) -> &str {
        self.message.path.as_ref().map(|p| p.as_str()).unwrap_or_default()
    }

    pub fn interface_name(&self) -> &str {
        self.message.interface.as_deref().unwrap_or_default()
    }

    pub fn method_name(&self) -> &str {
        self.message.member.as_deref().unwrap_or_default()
    }

    /// Argument tuple of the call
    pub fn parameters(&self) -> &Value {
        &self.message.body
    }

    /// Descriptor of the called method, if it was matched against one
    pub fn method_info(&self) -> Option<&MethodInfo> {
        self.method_info.as_ref()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The connection the call arrived on
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn take_handle(&mut self) -> Option<ReplyHandle> {
        match std::mem::replace(&mut self.state, ReplyState::Replied) {
            ReplyState::Unreplied(handle) => Some(handle),
            ReplyState::Replied => None,
        }
    }

    /// Replies with `value` as the return tuple
    ///
    /// A non-tuple value is sent as a single return value. If the type does
    /// not match the method's out-arguments a warning is logged and the
    /// caller receives `InvalidArgs` instead.
    pub fn return_value(mut self, value: impl Into<Value>) {
        let body = match value.into() {
            body @ Value::Tuple(_) => body,
            other => Value::Tuple(vec![other]),
        };
        let Some(handle) = self.take_handle() else {
            return;
        };

        if let Some(info) = &self.method_info {
            let expected = format!("({})", info.out_signature());
            let actual = body.signature();
            if actual != expected {
                warn!(
                    interface = %self.interface_name(),
                    method = %self.method_name(),
                    actual = %actual,
                    expected = %expected,
                    "Type of return value is incorrect"
                );
                handle.send(Message::error(
                    &self.message,
                    error_names::INVALID_ARGS,
                    &format!(
                        "Type of return value is incorrect: got '{}', expected '{}'",
                        actual, expected
                    ),
                ));
                return;
            }
        }

        handle.send(Message::method_return(&self.message, body));
    }

    /// Replies with an error derived from `error`
    ///
    /// Remote errors keep their name; anything else becomes
    /// `org.freedesktop.DBus.Error.Failed`.
    pub fn return_error(self, error: MockBusError) {
        match &error {
            MockBusError::Remote { name, message } => self.return_dbus_error(name, message),
            other => self.return_dbus_error(error_names::FAILED, &other.to_string()),
        }
    }

    /// Replies with the D-Bus error `error_name` and a message
    pub fn return_dbus_error(mut self, error_name: &str, error_message: &str) {
        let Some(handle) = self.take_handle() else {
            return;
        };
        let name = if is_error_name(error_name) {
            error_name
        } else {
            warn!(error_name = %error_name, "Invalid error name; replying with Failed");
            error_names::FAILED
        };
        handle.send(Message::error(&self.message, name, error_message));
    }
}

impl Drop for MethodInvocation {
    fn drop(&mut self) {
        if let Some(handle) = self.take_handle() {
            warn!(
                path = %self.object_path(),
                interface = %self.interface_name(),
                method = %self.method_name(),
                "Method invocation dropped without a reply"
            );
            handle.send(Message::error(
                &self.message,
                error_names::NO_REPLY,
                "Method call was dropped without a reply",
            ));
        }
    }
}

impl fmt::Debug for MethodInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInvocation")
            .field("sender", &self.sender())
            .field("path", &self.object_path())
            .field("interface", &self.interface_name())
            .field("method", &self.method_name())
            .field("parameters", &self.parameters().to_string())
            .field("replied", &matches!(self.state, ReplyState::Replied))
            .finish()
    }
}
