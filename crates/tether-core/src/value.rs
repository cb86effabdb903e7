//! The host-side dynamic value model.
//!
//! [`DynamicValue`] is what the embedding application passes into guest
//! functions and gets back from them. Strings are kept as raw bytes: a guest
//! may hand back text that is not valid UTF-8, and it is up to the consumer
//! to decide whether that matters.

use bytes::Bytes;

use crate::callback::CallbackRef;

/// A dynamically-typed value exchanged with guest code.
#[derive(Debug, Clone, Default)]
pub enum DynamicValue {
    /// Absence of a value.
    #[default]
    Nil,
    /// A boolean.
    Bool(bool),
    /// A signed 64-bit integer.
    Integer(i64),
    /// An IEEE-754 double.
    Float(f64),
    /// A byte string, normally UTF-8.
    String(Bytes),
    /// An ordered sequence.
    Array(Vec<DynamicValue>),
    /// Key/value pairs in insertion order.
    Map(Vec<(DynamicValue, DynamicValue)>),
    /// A weak reference to a guest callback.
    Callback(CallbackRef),
}

impl DynamicValue {
    /// Name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            DynamicValue::Nil => "nil",
            DynamicValue::Bool(_) => "bool",
            DynamicValue::Integer(_) => "integer",
            DynamicValue::Float(_) => "float",
            DynamicValue::String(_) => "string",
            DynamicValue::Array(_) => "array",
            DynamicValue::Map(_) => "map",
            DynamicValue::Callback(_) => "callback",
        }
    }

    /// Check for `Nil`.
    pub fn is_nil(&self) -> bool {
        matches!(self, DynamicValue::Nil)
    }

    /// Get the boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynamicValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the integer, if this is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            DynamicValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the float, if this is one.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            DynamicValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get the raw string bytes, if this is a string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DynamicValue::String(b) => Some(b),
            _ => None,
        }
    }

    /// Get the string as text. Returns `None` for non-strings and for
    /// strings that are not valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Get the elements, if this is an array.
    pub fn as_array(&self) -> Option<&[DynamicValue]> {
        match self {
            DynamicValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Get the entries, if this is a map.
    pub fn as_map(&self) -> Option<&[(DynamicValue, DynamicValue)]> {
        match self {
            DynamicValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Get the callback reference, if this is one.
    pub fn as_callback(&self) -> Option<CallbackRef> {
        match self {
            DynamicValue::Callback(r) => Some(*r),
            _ => None,
        }
    }

    /// Look up a map entry whose key is the given string.
    pub fn get(&self, key: &str) -> Option<&DynamicValue> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_bytes() == Some(key.as_bytes()))
            .map(|(_, v)| v)
    }
}

// Floats compare by bit pattern so that NaN payloads and signed zeros
// survive a round trip check.
impl PartialEq for DynamicValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DynamicValue::Nil, DynamicValue::Nil) => true,
            (DynamicValue::Bool(a), DynamicValue::Bool(b)) => a == b,
            (DynamicValue::Integer(a), DynamicValue::Integer(b)) => a == b,
            (DynamicValue::Float(a), DynamicValue::Float(b)) => a.to_bits() == b.to_bits(),
            (DynamicValue::String(a), DynamicValue::String(b)) => a == b,
            (DynamicValue::Array(a), DynamicValue::Array(b)) => a == b,
            (DynamicValue::Map(a), DynamicValue::Map(b)) => a == b,
            (DynamicValue::Callback(a), DynamicValue::Callback(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for DynamicValue {}

impl From<bool> for DynamicValue {
    fn from(b: bool) -> Self {
        DynamicValue::Bool(b)
    }
}

impl From<i64> for DynamicValue {
    fn from(i: i64) -> Self {
        DynamicValue::Integer(i)
    }
}

impl From<i32> for DynamicValue {
    fn from(i: i32) -> Self {
        DynamicValue::Integer(i64::from(i))
    }
}

impl From<f64> for DynamicValue {
    fn from(f: f64) -> Self {
        DynamicValue::Float(f)
    }
}

impl From<&str> for DynamicValue {
    fn from(s: &str) -> Self {
        DynamicValue::String(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for DynamicValue {
    fn from(s: String) -> Self {
        DynamicValue::String(Bytes::from(s))
    }
}

impl From<Vec<DynamicValue>> for DynamicValue {
    fn from(items: Vec<DynamicValue>) -> Self {
        DynamicValue::Array(items)
    }
}

impl From<CallbackRef> for DynamicValue {
    fn from(r: CallbackRef) -> Self {
        DynamicValue::Callback(r)
    }
}

impl<T: Into<DynamicValue>> From<Option<T>> for DynamicValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(DynamicValue::Nil, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(DynamicValue::Float(f64::NAN), DynamicValue::Float(f64::NAN));
        assert_ne!(DynamicValue::Float(0.0), DynamicValue::Float(-0.0));
    }

    #[test]
    fn test_non_utf8_string_is_kept() {
        let value = DynamicValue::String(Bytes::from_static(&[0xff, 0xfe, b'a']));
        assert_eq!(value.as_bytes(), Some(&[0xff, 0xfe, b'a'][..]));
        assert_eq!(value.as_str(), None);
    }

    #[test]
    fn test_string_conversions_agree() {
        let owned = DynamicValue::from(String::from("hello"));
        assert_eq!(owned, DynamicValue::from("hello"));
        assert_eq!(owned.as_str(), Some("hello"));
        assert_eq!(DynamicValue::from(None::<String>), DynamicValue::Nil);
    }

    #[test]
    fn test_map_lookup() {
        let map = DynamicValue::Map(vec![
            (DynamicValue::from("a"), DynamicValue::from(1i64)),
            (DynamicValue::from(2i64), DynamicValue::from("two")),
        ]);

        assert_eq!(map.get("a"), Some(&DynamicValue::Integer(1)));
        assert_eq!(map.get("b"), None);
        assert_eq!(DynamicValue::Nil.get("a"), None);
    }
}
