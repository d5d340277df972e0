//! Bus messages and well-known error names

use crate::names::ObjectPath;
use crate::value::Value;
use mockbus_shared::MockBusError;
use std::fmt::Write as _;

/// Bus name of the router itself; it is the sender of bus-generated errors
pub const BUS_NAME: &str = "org.freedesktop.DBus";

/// Standard `org.freedesktop.DBus.Error.*` names used by the router and dispatch
pub mod error_names {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const TIMEOUT: &str = "org.freedesktop.DBus.Error.Timeout";
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method-call",
            MessageType::MethodReturn => "method-return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }
}

/// A single bus message
///
/// The body is always a tuple, possibly empty. Serials are assigned by the
/// sending connection and the sender is stamped by the router.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub no_reply_expected: bool,
    pub serial: u32,
    pub reply_serial: Option<u32>,
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub body: Value,
}

fn into_tuple(body: Value) -> Value {
    match body {
        Value::Tuple(_) => body,
        other => Value::Tuple(vec![other]),
    }
}

impl Message {
    fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            no_reply_expected: false,
            serial: 0,
            reply_serial: None,
            sender: None,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            body: Value::unit(),
        }
    }

    /// Builds a method call; a non-tuple body becomes a one-element tuple
    pub fn method_call(
        destination: Option<&str>,
        path: ObjectPath,
        interface: Option<&str>,
        member: &str,
        body: Value,
    ) -> Self {
        Self {
            destination: destination.map(str::to_string),
            path: Some(path),
            interface: interface.map(str::to_string),
            member: Some(member.to_string()),
            body: into_tuple(body),
            ..Self::empty(MessageType::MethodCall)
        }
    }

    /// Builds the successful reply to `call`
    pub fn method_return(call: &Message, body: Value) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            body: into_tuple(body),
            ..Self::empty(MessageType::MethodReturn)
        }
    }

    /// Builds an error reply to `call`
    pub fn error(call: &Message, error_name: &str, error_message: &str) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(error_name.to_string()),
            body: Value::Tuple(vec![Value::from(error_message)]),
            ..Self::empty(MessageType::Error)
        }
    }

    /// Builds an error reply when only the caller and call serial are known
    pub fn error_for(
        destination: &str,
        reply_serial: u32,
        error_name: &str,
        error_message: &str,
    ) -> Self {
        Self {
            reply_serial: Some(reply_serial),
            destination: Some(destination.to_string()),
            error_name: Some(error_name.to_string()),
            body: Value::Tuple(vec![Value::from(error_message)]),
            ..Self::empty(MessageType::Error)
        }
    }

    /// Builds a signal emission
    pub fn signal(path: ObjectPath, interface: &str, member: &str, body: Value) -> Self {
        Self {
            path: Some(path),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            body: into_tuple(body),
            no_reply_expected: true,
            ..Self::empty(MessageType::Signal)
        }
    }

    /// Body signature without parentheses, e.g. `"us"`
    pub fn signature(&self) -> String {
        self.body.body_signature()
    }

    /// Whether the sender waits for a reply to this message
    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall && !self.no_reply_expected
    }

    /// Converts an error reply into the matching [`MockBusError::Remote`]
    pub fn to_error(&self) -> Option<MockBusError> {
        if self.message_type != MessageType::Error {
            return None;
        }
        let name = self
            .error_name
            .clone()
            .unwrap_or_else(|| error_names::FAILED.to_string());
        let text = match self.body.child(0) {
            Some(Value::Str(s)) => s.clone(),
            _ => String::new(),
        };
        Some(MockBusError::remote(name, text))
    }

    /// Renders the message over several lines for diagnostics
    ///
    /// Every line is prefixed with `indent` spaces. The layout is meant for
    /// people reading test output, not for parsing.
    pub fn print(&self, indent: usize) -> String {
        let pad = " ".repeat(indent);
        let mut out = String::new();

        let flags = if self.no_reply_expected {
            "no-reply-expected"
        } else {
            "none"
        };
        let _ = writeln!(out, "{}Type:    {}", pad, self.message_type.as_str());
        let _ = writeln!(out, "{}  Flags:   {}", pad, flags);
        let _ = writeln!(out, "{}  Version: 0", pad);
        let _ = writeln!(out, "{}  Serial:  {}", pad, self.serial);
        let _ = writeln!(out, "{}  Headers:", pad);

        if let Some(path) = &self.path {
            let _ = writeln!(out, "{}    path -> objectpath '{}'", pad, path);
        }
        let string_headers = [
            ("interface", &self.interface),
            ("member", &self.member),
            ("error-name", &self.error_name),
            ("destination", &self.destination),
            ("sender", &self.sender),
        ];
        for (header, value) in string_headers {
            if let Some(value) = value {
                let _ = writeln!(out, "{}    {} -> '{}'", pad, header, value);
            }
        }
        if let Some(reply_serial) = self.reply_serial {
            let _ = writeln!(out, "{}    reply-serial -> uint32 {}", pad, reply_serial);
        }
        let signature = self.signature();
        if !signature.is_empty() {
            let _ = writeln!(out, "{}    signature -> signature '{}'", pad, signature);
        }
        let _ = writeln!(out, "{}  Body: {}", pad, self.body);

        out
    }
}
