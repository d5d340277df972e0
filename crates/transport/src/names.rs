//! Validation of bus names, interface names, member names and object paths
//!
//! The rules follow the D-Bus specification. Validation is used both to
//! reject malformed registrations early and by the queue's contract checks.

use mockbus_shared::{MockBusError, Result};
use std::fmt;

/// Maximum length of any bus, interface, member or error name
pub const MAX_NAME_LENGTH: usize = 255;

fn is_name_char(c: char, allow_hyphen: bool) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || (allow_hyphen && c == '-')
}

/// Checks whether `name` is a valid bus name, unique or well-known
pub fn is_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }

    let (unique, body) = match name.strip_prefix(':') {
        Some(rest) => (true, rest),
        None => (false, name),
    };

    let elements: Vec<&str> = body.split('.').collect();
    if elements.len() < 2 {
        return false;
    }

    elements.iter().all(|element| {
        let mut chars = element.chars();
        match chars.next() {
            None => false,
            Some(first) => {
                (unique || !first.is_ascii_digit())
                    && is_name_char(first, true)
                    && chars.all(|c| is_name_char(c, true))
            }
        }
    })
}

/// Checks whether `name` is a valid unique connection name (`:1.42`)
pub fn is_unique_name(name: &str) -> bool {
    name.starts_with(':') && is_name(name)
}

/// Checks whether `name` is a valid well-known bus name
pub fn is_well_known_name(name: &str) -> bool {
    !name.starts_with(':') && is_name(name)
}

/// Checks whether `name` is a valid interface name
pub fn is_interface_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }

    let elements: Vec<&str> = name.split('.').collect();
    elements.len() >= 2 && elements.iter().all(|element| is_member_name(element))
}

/// Checks whether `name` is a valid error name; the rules match interface names
pub fn is_error_name(name: &str) -> bool {
    is_interface_name(name)
}

/// Checks whether `name` is a valid method, signal or property name
pub fn is_member_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        None => false,
        Some(first) => {
            name.len() <= MAX_NAME_LENGTH
                && !first.is_ascii_digit()
                && is_name_char(first, false)
                && chars.all(|c| is_name_char(c, false))
        }
    }
}

/// Checks whether `path` is a syntactically valid object path
pub fn is_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }

    match path.strip_prefix('/') {
        None => false,
        Some(rest) => rest
            .split('/')
            .all(|element| !element.is_empty() && element.chars().all(|c| is_name_char(c, false))),
    }
}

/// A validated D-Bus object path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validate and wrap an object path
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mockbus_transport::ObjectPath;
    ///
    /// assert!(ObjectPath::new("/com/example/Test").is_ok());
    /// assert!(ObjectPath::new("com/example/Test").is_err());
    /// ```
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if is_object_path(&path) {
            Ok(Self(path))
        } else {
            Err(MockBusError::invalid_argument(format!(
                "'{}' is not a valid object path",
                path
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = MockBusError;

    fn try_from(path: &str) -> Result<Self> {
        Self::new(path)
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = MockBusError;

    fn try_from(path: String) -> Result<Self> {
        Self::new(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_names() {
        assert!(is_name("com.example.Test"));
        assert!(is_name("org.freedesktop.DBus"));
        assert!(is_name("com.example-foo.Test_2"));
        assert!(is_name(":1.42"));

        assert!(!is_name(""));
        assert!(!is_name("com"));
        assert!(!is_name("com..example"));
        assert!(!is_name(".com.example"));
        assert!(!is_name("com.1example"));
        assert!(!is_name("com.exa mple"));
        assert!(!is_name(&format!("a.{}", "b".repeat(MAX_NAME_LENGTH))));
    }

    #[test]
    fn test_unique_and_well_known() {
        assert!(is_unique_name(":1.7"));
        assert!(!is_unique_name("com.example.Test"));
        assert!(is_well_known_name("com.example.Test"));
        assert!(!is_well_known_name(":1.7"));
        assert!(!is_well_known_name("a"));
    }

    #[test]
    fn test_interface_and_member_names() {
        assert!(is_interface_name("com.example.Test.Manager"));
        assert!(is_interface_name("org.freedesktop.DBus.Properties"));
        assert!(!is_interface_name("Manager"));
        assert!(!is_interface_name("com.example-foo.Test"));
        assert!(!is_interface_name("com.2example"));

        assert!(is_member_name("GetObjectPath"));
        assert!(is_member_name("_private"));
        assert!(!is_member_name(""));
        assert!(!is_member_name("Get.Object"));
        assert!(!is_member_name("9Lives"));
        assert!(!is_member_name("some-string"));

        assert!(is_error_name("org.freedesktop.DBus.Error.Failed"));
    }

    #[test]
    fn test_object_paths() {
        assert!(is_object_path("/"));
        assert!(is_object_path("/com/example/Test"));
        assert!(is_object_path("/com/example/Test/Object123"));

        assert!(!is_object_path(""));
        assert!(!is_object_path("com/example"));
        assert!(!is_object_path("/com/example/"));
        assert!(!is_object_path("//com"));
        assert!(!is_object_path("/com/ex-ample"));
    }

    #[test]
    fn test_object_path_type() {
        let path = ObjectPath::new("/com/example/Test").unwrap();
        assert_eq!(path.as_str(), "/com/example/Test");
        assert_eq!(path.to_string(), "/com/example/Test");

        let err = ObjectPath::try_from("not/a/path").unwrap_err();
        assert!(matches!(err, MockBusError::InvalidArgument { .. }));
    }
}
