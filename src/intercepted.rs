//! Values exchanged with the native interception layer
//!
//! Arguments, return values and thrown objects of intercepted calls arrive as
//! dynamically typed values. Strings are raw byte strings: the host runtime
//! does not guarantee UTF-8, so validity is only checked when a value is
//! serialized.

use serde::ser::Error as _;
use serde::{Serialize, Serializer};
use std::fmt;

/// Byte string as received from the host runtime (may not be valid UTF-8)
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct RawText(Vec<u8>);

impl RawText {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Borrow as `&str` if the bytes are valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Lossy conversion for logging and span names
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for RawText {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for RawText {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl fmt::Debug for RawText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(text) => write!(f, "{:?}", text),
            None => write!(f, "<invalid UTF-8: 0x{}>", hex::encode(&self.0)),
        }
    }
}

impl Serialize for RawText {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(text) => serializer.serialize_str(text),
            Err(err) => Err(S::Error::custom(format!(
                "string value is not valid UTF-8: {}",
                err
            ))),
        }
    }
}

/// Reference to a host-runtime object (`$this` of a method call)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHandle {
    pub class_name: String,
    /// Stable identity of the object for its lifetime
    pub handle_id: u64,
}

impl ObjectHandle {
    pub fn new(class_name: impl Into<String>, handle_id: u64) -> Self {
        Self {
            class_name: class_name.into(),
            handle_id,
        }
    }

    pub fn is_instance_of(&self, class_name: &str) -> bool {
        self.class_name.eq_ignore_ascii_case(class_name)
    }
}

/// Exception/error object thrown by an intercepted call
#[derive(Debug, Clone, PartialEq)]
pub struct ThrowableInfo {
    pub class_name: String,
    pub message: RawText,
    pub code: Option<i64>,
}

impl ThrowableInfo {
    pub fn new(class_name: impl Into<String>, message: impl Into<RawText>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }
}

/// Dynamically typed argument, return value or thrown object
#[derive(Debug, Clone, PartialEq)]
pub enum InterceptedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(RawText),
    /// Ordered key/value pairs (host arrays are ordered maps)
    Array(Vec<(InterceptedValue, InterceptedValue)>),
    Object(ObjectHandle),
    /// Opaque resource such as a curl handle
    Resource(u64),
    Throwable(ThrowableInfo),
}

impl InterceptedValue {
    pub fn str(value: impl Into<RawText>) -> Self {
        InterceptedValue::Str(value.into())
    }

    pub fn as_raw_text(&self) -> Option<&RawText> {
        match self {
            InterceptedValue::Str(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            InterceptedValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectHandle> {
        match self {
            InterceptedValue::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_resource(&self) -> Option<u64> {
        match self {
            InterceptedValue::Resource(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_throwable(&self) -> Option<&ThrowableInfo> {
        match self {
            InterceptedValue::Throwable(throwable) => Some(throwable),
            _ => None,
        }
    }

    /// Truthiness following the host runtime's loose boolean conversion
    pub fn is_truthy(&self) -> bool {
        match self {
            InterceptedValue::Null => false,
            InterceptedValue::Bool(value) => *value,
            InterceptedValue::Int(value) => *value != 0,
            InterceptedValue::Float(value) => *value != 0.0,
            InterceptedValue::Str(text) => !(text.is_empty() || text.as_bytes() == b"0"),
            InterceptedValue::Array(entries) => !entries.is_empty(),
            InterceptedValue::Object(_)
            | InterceptedValue::Resource(_)
            | InterceptedValue::Throwable(_) => true,
        }
    }

    /// Short type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            InterceptedValue::Null => "null",
            InterceptedValue::Bool(_) => "bool",
            InterceptedValue::Int(_) => "int",
            InterceptedValue::Float(_) => "float",
            InterceptedValue::Str(_) => "string",
            InterceptedValue::Array(_) => "array",
            InterceptedValue::Object(_) => "object",
            InterceptedValue::Resource(_) => "resource",
            InterceptedValue::Throwable(_) => "throwable",
        }
    }
}
