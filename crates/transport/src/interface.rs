//! Interface descriptors
//!
//! An [`InterfaceInfo`] describes what an exported object answers to: its
//! methods with typed in/out arguments, its signals and its properties.
//! Descriptors are plain data, built with chained constructors and checked
//! with [`InterfaceInfo::validate`] before export.

use crate::names::{is_interface_name, is_member_name};
use crate::value::is_single_complete_type;
use mockbus_shared::{MockBusError, Result};

/// A named, typed method or signal argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    pub name: String,
    pub signature: String,
}

impl ArgInfo {
    pub fn new(name: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signature: signature.into(),
        }
    }
}

fn concat_signatures(args: &[ArgInfo]) -> String {
    args.iter().map(|a| a.signature.as_str()).collect()
}

/// Method descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub in_args: Vec<ArgInfo>,
    pub out_args: Vec<ArgInfo>,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_args: Vec::new(),
            out_args: Vec::new(),
        }
    }

    pub fn in_arg(mut self, name: impl Into<String>, signature: impl Into<String>) -> Self {
        self.in_args.push(ArgInfo::new(name, signature));
        self
    }

    pub fn out_arg(mut self, name: impl Into<String>, signature: impl Into<String>) -> Self {
        self.out_args.push(ArgInfo::new(name, signature));
        self
    }

    /// Concatenated in-argument signature, e.g. `"us"`
    pub fn in_signature(&self) -> String {
        concat_signatures(&self.in_args)
    }

    /// Concatenated out-argument signature
    pub fn out_signature(&self) -> String {
        concat_signatures(&self.out_args)
    }
}

/// Signal descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalInfo {
    pub name: String,
    pub args: Vec<ArgInfo>,
}

impl SignalInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, signature: impl Into<String>) -> Self {
        self.args.push(ArgInfo::new(name, signature));
        self
    }
}

/// Property access flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    pub fn is_readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }
}

/// Property descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: String,
    pub signature: String,
    pub access: PropertyAccess,
}

impl PropertyInfo {
    pub fn new(
        name: impl Into<String>,
        signature: impl Into<String>,
        access: PropertyAccess,
    ) -> Self {
        Self {
            name: name.into(),
            signature: signature.into(),
            access,
        }
    }
}

/// Interface descriptor
///
/// # Examples
///
/// ```rust
/// use mockbus_transport::{InterfaceInfo, MethodInfo};
///
/// let manager = InterfaceInfo::new("com.example.Test.Manager")
///     .method(MethodInfo::new("GetObjectPath").in_arg("id", "u").out_arg("path", "o"));
/// assert!(manager.validate().is_ok());
/// assert!(manager.lookup_method("GetObjectPath").is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub methods: Vec<MethodInfo>,
    pub signals: Vec<SignalInfo>,
    pub properties: Vec<PropertyInfo>,
}

impl InterfaceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            signals: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodInfo) -> Self {
        self.methods.push(method);
        self
    }

    pub fn signal(mut self, signal: SignalInfo) -> Self {
        self.signals.push(signal);
        self
    }

    pub fn property(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    pub fn lookup_method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn lookup_signal(&self, name: &str) -> Option<&SignalInfo> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn lookup_property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Checks names and signatures of the interface and all its members
    pub fn validate(&self) -> Result<()> {
        if !is_interface_name(&self.name) {
            return Err(MockBusError::invalid_argument(format!(
                "'{}' is not a valid interface name",
                self.name
            )));
        }

        let check_member = |kind: &str, name: &str| -> Result<()> {
            if is_member_name(name) {
                Ok(())
            } else {
                Err(MockBusError::invalid_argument(format!(
                    "'{}' is not a valid {} name in {}",
                    name, kind, self.name
                )))
            }
        };
        let check_args = |owner: &str, args: &[ArgInfo]| -> Result<()> {
            match args.iter().find(|a| !is_single_complete_type(&a.signature)) {
                Some(bad) => Err(MockBusError::invalid_argument(format!(
                    "argument '{}' of {}.{} has invalid signature '{}'",
                    bad.name, self.name, owner, bad.signature
                ))),
                None => Ok(()),
            }
        };

        for method in &self.methods {
            check_member("method", &method.name)?;
            check_args(&method.name, &method.in_args)?;
            check_args(&method.name, &method.out_args)?;
        }
        for signal in &self.signals {
            check_member("signal", &signal.name)?;
            check_args(&signal.name, &signal.args)?;
        }
        for property in &self.properties {
            check_member("property", &property.name)?;
            if !is_single_complete_type(&property.signature) {
                return Err(MockBusError::invalid_argument(format!(
                    "property {}.{} has invalid signature '{}'",
                    self.name, property.name, property.signature
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_interface() -> InterfaceInfo {
        InterfaceInfo::new("com.example.Test.Object")
            .property(PropertyInfo::new("some-str", "s", PropertyAccess::Read))
            .property(PropertyInfo::new("some-int", "u", PropertyAccess::ReadWrite))
            .signal(SignalInfo::new("Changed").arg("what", "s"))
    }

    #[test]
    fn test_method_signatures() {
        let method = MethodInfo::new("Frob")
            .in_arg("a", "u")
            .in_arg("b", "as")
            .out_arg("c", "a{sv}");
        assert_eq!(method.in_signature(), "uas");
        assert_eq!(method.out_signature(), "a{sv}");
        assert_eq!(MethodInfo::new("Ping").in_signature(), "");
    }

    #[test]
    fn test_validate_rejects_hyphenated_property_names() {
        // Property names follow member-name rules, so hyphens are rejected.
        let err = object_interface().validate().unwrap_err();
        assert!(err.to_string().contains("some-str"));

        let ok = InterfaceInfo::new("com.example.Test.Object")
            .property(PropertyInfo::new("SomeStr", "s", PropertyAccess::Read));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_names_and_signatures() {
        assert!(InterfaceInfo::new("NoDots").validate().is_err());
        assert!(InterfaceInfo::new("com.example.I")
            .method(MethodInfo::new("Bad.Name"))
            .validate()
            .is_err());
        assert!(InterfaceInfo::new("com.example.I")
            .method(MethodInfo::new("M").in_arg("x", "a"))
            .validate()
            .is_err());
        assert!(InterfaceInfo::new("com.example.I")
            .method(MethodInfo::new("M").out_arg("x", "uu"))
            .validate()
            .is_err());
    }

    #[test]
    fn test_lookups_and_access() {
        let iface = object_interface();
        assert!(iface.lookup_property("some-int").unwrap().access.is_writable());
        assert!(!iface.lookup_property("some-str").unwrap().access.is_writable());
        assert!(iface.lookup_signal("Changed").is_some());
        assert!(iface.lookup_method("Changed").is_none());
    }
}
