//! Typed values carried in message bodies
//!
//! [`Value`] mirrors the D-Bus type system: basic types, object paths,
//! signatures, variants, typed arrays, typed dictionaries and tuples. Every
//! message body is a [`Value::Tuple`].
//!
//! Values render in a GVariant-like text format with type annotations where
//! the type would otherwise be ambiguous, e.g. `(uint32 123,)` or
//! `@as []`. The format is meant for humans reading test failures and is
//! not guaranteed to be stable.
//!
//! Decoding goes through [`FromValue`]. [`ArgSlot`] wraps it as a
//! caller-supplied output location, which is how assertion helpers hand
//! popped arguments back to tests.

use crate::names::ObjectPath;
use mockbus_shared::{MockBusError, Result};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// A D-Bus typed value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Signature(String),
    Variant(Box<Value>),
    /// Homogeneous array; the element signature is kept so empty arrays stay typed
    Array {
        element_signature: String,
        items: Vec<Value>,
    },
    /// Dictionary with basic-typed keys
    Dict {
        key_signature: String,
        value_signature: String,
        entries: Vec<(Value, Value)>,
    },
    Tuple(Vec<Value>),
}

impl Value {
    /// The D-Bus signature of this value
    pub fn signature(&self) -> String {
        match self {
            Value::Bool(_) => "b".to_string(),
            Value::Byte(_) => "y".to_string(),
            Value::Int16(_) => "n".to_string(),
            Value::Uint16(_) => "q".to_string(),
            Value::Int32(_) => "i".to_string(),
            Value::Uint32(_) => "u".to_string(),
            Value::Int64(_) => "x".to_string(),
            Value::Uint64(_) => "t".to_string(),
            Value::Double(_) => "d".to_string(),
            Value::Str(_) => "s".to_string(),
            Value::ObjectPath(_) => "o".to_string(),
            Value::Signature(_) => "g".to_string(),
            Value::Variant(_) => "v".to_string(),
            Value::Array {
                element_signature, ..
            } => format!("a{}", element_signature),
            Value::Dict {
                key_signature,
                value_signature,
                ..
            } => format!("a{{{}{}}}", key_signature, value_signature),
            Value::Tuple(items) => {
                let inner: String = items.iter().map(Value::signature).collect();
                format!("({})", inner)
            }
        }
    }

    /// Signature of a tuple's members without the surrounding parentheses
    ///
    /// This is the form used for message body signatures and method argument
    /// lists. For non-tuples it is the plain signature.
    pub fn body_signature(&self) -> String {
        match self {
            Value::Tuple(items) => items.iter().map(Value::signature).collect(),
            other => other.signature(),
        }
    }

    /// Builds a tuple from its members
    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(items)
    }

    /// The empty tuple, used as the body of argument-less calls and replies
    pub fn unit() -> Self {
        Value::Tuple(Vec::new())
    }

    /// Wraps a value in a variant
    pub fn variant(inner: impl Into<Value>) -> Self {
        Value::Variant(Box::new(inner.into()))
    }

    /// Builds an object path value, validating the path
    pub fn object_path(path: &str) -> Result<Self> {
        Ok(Value::ObjectPath(ObjectPath::new(path)?))
    }

    /// Builds a typed array, checking that every item matches `element_signature`
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mockbus_transport::Value;
    ///
    /// let empty = Value::array("s", Vec::new()).unwrap();
    /// assert_eq!(empty.signature(), "as");
    /// assert!(Value::array("s", vec![Value::from(1u32)]).is_err());
    /// ```
    pub fn array(element_signature: &str, items: Vec<Value>) -> Result<Self> {
        if !is_single_complete_type(element_signature) {
            return Err(MockBusError::invalid_argument(format!(
                "'{}' is not a single complete type",
                element_signature
            )));
        }
        if let Some(bad) = items.iter().find(|v| v.signature() != element_signature) {
            return Err(MockBusError::invalid_argument(format!(
                "array item of type '{}' in array of '{}'",
                bad.signature(),
                element_signature
            )));
        }
        Ok(Value::Array {
            element_signature: element_signature.to_string(),
            items,
        })
    }

    /// Builds a typed dictionary, checking key and value signatures
    pub fn dict(
        key_signature: &str,
        value_signature: &str,
        entries: Vec<(Value, Value)>,
    ) -> Result<Self> {
        if !is_basic_type(key_signature) {
            return Err(MockBusError::invalid_argument(format!(
                "dictionary key type '{}' is not a basic type",
                key_signature
            )));
        }
        if !is_single_complete_type(value_signature) {
            return Err(MockBusError::invalid_argument(format!(
                "'{}' is not a single complete type",
                value_signature
            )));
        }
        for (key, value) in &entries {
            if key.signature() != key_signature || value.signature() != value_signature {
                return Err(MockBusError::invalid_argument(format!(
                    "entry of type {{{}{}}} in dictionary of {{{}{}}}",
                    key.signature(),
                    value.signature(),
                    key_signature,
                    value_signature
                )));
            }
        }
        Ok(Value::Dict {
            key_signature: key_signature.to_string(),
            value_signature: value_signature.to_string(),
            entries,
        })
    }

    /// Builds an `a{sv}` dictionary, wrapping every value in a variant
    ///
    /// This is the shape of `org.freedesktop.DBus.Properties.GetAll` replies.
    pub fn vardict<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Dict {
            key_signature: "s".to_string(),
            value_signature: "v".to_string(),
            entries: entries
                .into_iter()
                .map(|(k, v)| (Value::Str(k.into()), Value::variant(v)))
                .collect(),
        }
    }

    /// Strips any number of variant layers
    pub fn unboxed(&self) -> &Value {
        match self {
            Value::Variant(inner) => inner.unboxed(),
            other => other,
        }
    }

    /// Returns the `index`th member of a tuple
    pub fn child(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Tuple(items) => items.get(index),
            Value::Array { items, .. } => items.get(index),
            _ => None,
        }
    }

    /// Number of members of a tuple or items of an array or dictionary
    pub fn n_children(&self) -> usize {
        match self {
            Value::Tuple(items) | Value::Array { items, .. } => items.len(),
            Value::Dict { entries, .. } => entries.len(),
            _ => 0,
        }
    }

    /// Looks up a string key in a dictionary, unboxing variant values
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        match self.unboxed() {
            Value::Dict { entries, .. } => entries.iter().find_map(|(k, v)| match k {
                Value::Str(s) if s == key => Some(v.unboxed()),
                _ => None,
            }),
            _ => None,
        }
    }

    /// Decodes this value into a Rust type
    pub fn get<T: FromValue>(&self) -> Result<T> {
        T::from_value(self)
    }

    /// Checks whether this value has the type described by `signature`
    pub fn is_of_type(&self, signature: &str) -> bool {
        self.signature() == signature
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("'")?;
    for c in s.chars() {
        match c {
            '\'' => f.write_str("\\'")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            other => write!(f, "{}", other)?,
        }
    }
    f.write_str("'")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Byte(b) => write!(f, "byte 0x{:02x}", b),
            Value::Int16(n) => write!(f, "int16 {}", n),
            Value::Uint16(n) => write!(f, "uint16 {}", n),
            Value::Int32(n) => write!(f, "{}", n),
            Value::Uint32(n) => write!(f, "uint32 {}", n),
            Value::Int64(n) => write!(f, "int64 {}", n),
            Value::Uint64(n) => write!(f, "uint64 {}", n),
            Value::Double(d) => write!(f, "{:?}", d),
            Value::Str(s) => write_quoted(f, s),
            Value::ObjectPath(p) => {
                f.write_str("objectpath ")?;
                write_quoted(f, p.as_str())
            }
            Value::Signature(s) => {
                f.write_str("signature ")?;
                write_quoted(f, s)
            }
            Value::Variant(inner) => write!(f, "<{}>", inner),
            Value::Array { items, .. } if items.is_empty() => write!(f, "@{} []", self.signature()),
            Value::Array { items, .. } => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Dict { entries, .. } if entries.is_empty() => {
                write!(f, "@{} {{}}", self.signature())
            }
            Value::Dict { entries, .. } => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
            Value::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
        }
    }
}

// === Signatures ===

fn is_basic_code(c: u8) -> bool {
    matches!(
        c,
        b'b' | b'y' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g'
    )
}

/// Parses one complete type starting at `pos`, returning the end offset
fn parse_complete_type(sig: &[u8], pos: usize) -> Option<usize> {
    let c = *sig.get(pos)?;
    match c {
        c if is_basic_code(c) => Some(pos + 1),
        b'v' => Some(pos + 1),
        b'a' => {
            if sig.get(pos + 1) == Some(&b'{') {
                let key = *sig.get(pos + 2)?;
                if !is_basic_code(key) {
                    return None;
                }
                let end = parse_complete_type(sig, pos + 3)?;
                if sig.get(end) == Some(&b'}') {
                    Some(end + 1)
                } else {
                    None
                }
            } else {
                parse_complete_type(sig, pos + 1)
            }
        }
        b'(' => {
            let mut cursor = pos + 1;
            while sig.get(cursor) != Some(&b')') {
                cursor = parse_complete_type(sig, cursor)?;
            }
            Some(cursor + 1)
        }
        _ => None,
    }
}

/// Checks whether `signature` is a (possibly empty) sequence of complete types
pub fn is_valid_signature(signature: &str) -> bool {
    let bytes = signature.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        match parse_complete_type(bytes, pos) {
            Some(end) => pos = end,
            None => return false,
        }
    }
    signature.len() <= 255
}

/// Checks whether `signature` is exactly one complete type
pub fn is_single_complete_type(signature: &str) -> bool {
    let bytes = signature.as_bytes();
    matches!(parse_complete_type(bytes, 0), Some(end) if end == bytes.len())
}

/// Checks whether `signature` is a basic (dictionary-key-capable) type
pub fn is_basic_type(signature: &str) -> bool {
    signature.len() == 1 && is_basic_code(signature.as_bytes()[0])
}

// === Conversions into Value ===

/// Rust types with a fixed D-Bus signature
///
/// Needed so that empty `Vec`s and `HashMap`s still produce typed values.
pub trait StaticType {
    fn static_signature() -> String;
}

macro_rules! impl_basic {
    ($rust:ty, $variant:ident, $sig:expr) => {
        impl From<$rust> for Value {
            fn from(v: $rust) -> Self {
                Value::$variant(v)
            }
        }

        impl StaticType for $rust {
            fn static_signature() -> String {
                $sig.to_string()
            }
        }

        impl FromValue for $rust {
            fn from_value(value: &Value) -> Result<Self> {
                match value.unboxed() {
                    Value::$variant(v) => Ok(v.clone()),
                    other => Err(MockBusError::decode($sig, other.signature())),
                }
            }
        }
    };
}

impl_basic!(bool, Bool, "b");
impl_basic!(u8, Byte, "y");
impl_basic!(i16, Int16, "n");
impl_basic!(u16, Uint16, "q");
impl_basic!(i32, Int32, "i");
impl_basic!(u32, Uint32, "u");
impl_basic!(i64, Int64, "x");
impl_basic!(u64, Uint64, "t");
impl_basic!(f64, Double, "d");
impl_basic!(ObjectPath, ObjectPath, "o");

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl StaticType for String {
    fn static_signature() -> String {
        "s".to_string()
    }
}

impl StaticType for &str {
    fn static_signature() -> String {
        "s".to_string()
    }
}

impl<T: Into<Value> + StaticType> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array {
            element_signature: T::static_signature(),
            items: items.into_iter().map(Into::into).collect(),
        }
    }
}

impl<T: StaticType> StaticType for Vec<T> {
    fn static_signature() -> String {
        format!("a{}", T::static_signature())
    }
}

impl<K, V> From<HashMap<K, V>> for Value
where
    K: Into<Value> + StaticType,
    V: Into<Value> + StaticType,
{
    fn from(map: HashMap<K, V>) -> Self {
        Value::Dict {
            key_signature: K::static_signature(),
            value_signature: V::static_signature(),
            entries: map.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

macro_rules! impl_tuple {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Into<Value>),+> From<($($name,)+)> for Value {
            fn from(t: ($($name,)+)) -> Self {
                Value::Tuple(vec![$(t.$idx.into()),+])
            }
        }

        impl<$($name: FromValue),+> FromValue for ($($name,)+) {
            fn from_value(value: &Value) -> Result<Self> {
                let count = [$($idx),+].len();
                match value.unboxed() {
                    Value::Tuple(items) if items.len() == count => {
                        Ok(($($name::from_value(&items[$idx])?,)+))
                    }
                    other => Err(MockBusError::decode(
                        format!("tuple of {} members", count),
                        other.signature(),
                    )),
                }
            }
        }
    };
}

impl_tuple!(A: 0);
impl_tuple!(A: 0, B: 1);
impl_tuple!(A: 0, B: 1, C: 2);
impl_tuple!(A: 0, B: 1, C: 2, D: 3);
impl_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::unit()
    }
}

// === Decoding ===

/// Conversion from a [`Value`] into a Rust type
///
/// Variant layers are unwrapped transparently, so a `u32` can be read out of
/// an `a{sv}` entry directly.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value.unboxed() {
            Value::Str(s) | Value::Signature(s) => Ok(s.clone()),
            Value::ObjectPath(p) => Ok(p.as_str().to_string()),
            other => Err(MockBusError::decode("s", other.signature())),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value.unboxed() {
            Value::Array { items, .. } => items.iter().map(T::from_value).collect(),
            other => Err(MockBusError::decode("array", other.signature())),
        }
    }
}

impl<K, V> FromValue for HashMap<K, V>
where
    K: FromValue + Eq + Hash,
    V: FromValue,
{
    fn from_value(value: &Value) -> Result<Self> {
        match value.unboxed() {
            Value::Dict { entries, .. } => entries
                .iter()
                .map(|(k, v)| Ok((K::from_value(k)?, V::from_value(v)?)))
                .collect(),
            other => Err(MockBusError::decode("dictionary", other.signature())),
        }
    }
}

impl FromValue for () {
    fn from_value(value: &Value) -> Result<Self> {
        match value.unboxed() {
            Value::Tuple(items) if items.is_empty() => Ok(()),
            other => Err(MockBusError::decode("()", other.signature())),
        }
    }
}

/// Output slot that accepts and discards any value
///
/// Pass it where a positional argument is not interesting to the test.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ignore;

impl FromValue for Ignore {
    fn from_value(_value: &Value) -> Result<Self> {
        Ok(Ignore)
    }
}

/// A caller-supplied output location for one positional argument
pub trait ArgSlot {
    /// Decode `value` into this slot, leaving it untouched on failure
    fn fill(&mut self, value: &Value) -> Result<()>;
}

impl<T: FromValue> ArgSlot for T {
    fn fill(&mut self, value: &Value) -> Result<()> {
        *self = T::from_value(value)?;
        Ok(())
    }
}

/// Decodes the members of `args` into `slots`, one per position
///
/// Every failure is returned together with its position; slots that fail
/// keep their previous contents and the remaining slots are still filled.
pub fn fill_slots(args: &Value, slots: &mut [&mut dyn ArgSlot]) -> Vec<(usize, MockBusError)> {
    let mut failures = Vec::new();
    let available = args.n_children();

    if slots.len() != available {
        failures.push((
            slots.len().min(available),
            MockBusError::decode(
                format!("{} arguments", slots.len()),
                format!("{} arguments of type {}", available, args.signature()),
            ),
        ));
    }

    for (index, slot) in slots.iter_mut().enumerate() {
        if let Some(value) = args.child(index) {
            if let Err(e) = slot.fill(value) {
                failures.push((index, e));
            }
        }
    }

    failures
}
