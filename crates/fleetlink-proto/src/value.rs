//! Type signatures and values

use crate::ProtocolError;
use std::collections::HashMap;

/// Maximum nesting of containers inside one signature
const MAX_DEPTH: usize = 32;

/// A single complete D-Bus type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// `y`
    Byte,
    /// `b`
    Boolean,
    /// `n`
    Int16,
    /// `q`
    Uint16,
    /// `i`
    Int32,
    /// `u`
    Uint32,
    /// `x`
    Int64,
    /// `t`
    Uint64,
    /// `d`
    Double,
    /// `s`
    String,
    /// `o`
    ObjectPath,
    /// `g`
    Signature,
    /// `h`
    UnixFd,
    /// `v`
    Variant,
    /// `a<T>`
    Array(Box<Type>),
    /// `(...)`
    Struct(Vec<Type>),
    /// `{KV}`, only valid as an array element
    DictEntry(Box<Type>, Box<Type>),
}

impl Type {
    /// Alignment of this type on the wire
    pub fn alignment(&self) -> usize {
        match self {
            Type::Byte | Type::Signature | Type::Variant => 1,
            Type::Int16 | Type::Uint16 => 2,
            Type::Boolean
            | Type::Int32
            | Type::Uint32
            | Type::UnixFd
            | Type::String
            | Type::ObjectPath
            | Type::Array(_) => 4,
            Type::Int64 | Type::Uint64 | Type::Double | Type::Struct(_) | Type::DictEntry(..) => 8,
        }
    }

    /// Render the signature string for this type
    pub fn signature(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Type::Byte => out.push('y'),
            Type::Boolean => out.push('b'),
            Type::Int16 => out.push('n'),
            Type::Uint16 => out.push('q'),
            Type::Int32 => out.push('i'),
            Type::Uint32 => out.push('u'),
            Type::Int64 => out.push('x'),
            Type::Uint64 => out.push('t'),
            Type::Double => out.push('d'),
            Type::String => out.push('s'),
            Type::ObjectPath => out.push('o'),
            Type::Signature => out.push('g'),
            Type::UnixFd => out.push('h'),
            Type::Variant => out.push('v'),
            Type::Array(inner) => {
                out.push('a');
                inner.write_signature(out);
            }
            Type::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            Type::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
        }
    }

    fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Variant | Type::Array(_) | Type::Struct(_) | Type::DictEntry(..)
        )
    }
}

/// Parse a signature into its sequence of complete types
pub fn parse_signature(signature: &str) -> Result<Vec<Type>, ProtocolError> {
    if signature.len() > 255 {
        return Err(ProtocolError::InvalidSignature(signature.to_string()));
    }

    let bytes = signature.as_bytes();
    let mut pos = 0;
    let mut types = Vec::new();
    while pos < bytes.len() {
        types.push(parse_one(signature, bytes, &mut pos, 0, false)?);
    }
    Ok(types)
}

fn parse_one(
    signature: &str,
    bytes: &[u8],
    pos: &mut usize,
    depth: usize,
    in_array: bool,
) -> Result<Type, ProtocolError> {
    let invalid = || ProtocolError::InvalidSignature(signature.to_string());
    if depth > MAX_DEPTH {
        return Err(invalid());
    }

    let code = *bytes.get(*pos).ok_or_else(invalid)?;
    *pos += 1;

    let parsed = match code {
        b'y' => Type::Byte,
        b'b' => Type::Boolean,
        b'n' => Type::Int16,
        b'q' => Type::Uint16,
        b'i' => Type::Int32,
        b'u' => Type::Uint32,
        b'x' => Type::Int64,
        b't' => Type::Uint64,
        b'd' => Type::Double,
        b's' => Type::String,
        b'o' => Type::ObjectPath,
        b'g' => Type::Signature,
        b'h' => Type::UnixFd,
        b'v' => Type::Variant,
        b'a' => Type::Array(Box::new(parse_one(signature, bytes, pos, depth + 1, true)?)),
        b'(' => {
            let mut fields = Vec::new();
            loop {
                match bytes.get(*pos) {
                    Some(b')') => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => fields.push(parse_one(signature, bytes, pos, depth + 1, false)?),
                    None => return Err(invalid()),
                }
            }
            if fields.is_empty() {
                return Err(invalid());
            }
            Type::Struct(fields)
        }
        b'{' if in_array => {
            let key = parse_one(signature, bytes, pos, depth + 1, false)?;
            if !key.is_basic() {
                return Err(invalid());
            }
            let value = parse_one(signature, bytes, pos, depth + 1, false)?;
            if bytes.get(*pos) != Some(&b'}') {
                return Err(invalid());
            }
            *pos += 1;
            Type::DictEntry(Box::new(key), Box::new(value))
        }
        _ => return Err(invalid()),
    };

    Ok(parsed)
}

/// A typed D-Bus value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `y`
    Byte(u8),
    /// `b`
    Boolean(bool),
    /// `n`
    Int16(i16),
    /// `q`
    Uint16(u16),
    /// `i`
    Int32(i32),
    /// `u`
    Uint32(u32),
    /// `x`
    Int64(i64),
    /// `t`
    Uint64(u64),
    /// `d`
    Double(f64),
    /// `s`
    String(String),
    /// `o`
    ObjectPath(String),
    /// `g`
    Signature(String),
    /// `h`, index into the out-of-band descriptor list
    UnixFd(u32),
    /// `v`
    Variant(Box<Value>),
    /// `a<T>`; the element type is kept so empty arrays still have a signature
    Array(Type, Vec<Value>),
    /// `(...)`
    Struct(Vec<Value>),
    /// `{KV}`
    DictEntry(Box<Value>, Box<Value>),
}

impl Value {
    /// The type describing this value
    pub fn value_type(&self) -> Type {
        match self {
            Value::Byte(_) => Type::Byte,
            Value::Boolean(_) => Type::Boolean,
            Value::Int16(_) => Type::Int16,
            Value::Uint16(_) => Type::Uint16,
            Value::Int32(_) => Type::Int32,
            Value::Uint32(_) => Type::Uint32,
            Value::Int64(_) => Type::Int64,
            Value::Uint64(_) => Type::Uint64,
            Value::Double(_) => Type::Double,
            Value::String(_) => Type::String,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::UnixFd(_) => Type::UnixFd,
            Value::Variant(_) => Type::Variant,
            Value::Array(element, _) => Type::Array(Box::new(element.clone())),
            Value::Struct(fields) => Type::Struct(fields.iter().map(Value::value_type).collect()),
            Value::DictEntry(key, value) => {
                Type::DictEntry(Box::new(key.value_type()), Box::new(value.value_type()))
            }
        }
    }

    /// Build an `as` array from string slices
    pub fn string_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Array(
            Type::String,
            items.into_iter().map(|s| Value::String(s.into())).collect(),
        )
    }

    /// Borrow the string payload of `s`, `o` and `g` values, looking through variants
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            Value::Variant(inner) => inner.as_str(),
            _ => None,
        }
    }

    /// Boolean payload, looking through variants
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Variant(inner) => inner.as_bool(),
            _ => None,
        }
    }

    /// Widen any unsigned integer payload, looking through variants
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Byte(v) => Some(u64::from(*v)),
            Value::Uint16(v) => Some(u64::from(*v)),
            Value::Uint32(v) => Some(u64::from(*v)),
            Value::Uint64(v) => Some(*v),
            Value::Variant(inner) => inner.as_u64(),
            _ => None,
        }
    }

    /// Convert an `a{sv}` value into a map of property name to (unwrapped) value
    pub fn into_property_map(self) -> Option<HashMap<String, Value>> {
        let Value::Array(_, entries) = self else {
            return None;
        };

        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            let Value::DictEntry(key, value) = entry else {
                return None;
            };
            let key = key.as_str()?.to_string();
            let value = match *value {
                Value::Variant(inner) => *inner,
                other => other,
            };
            map.insert(key, value);
        }
        Some(map)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint32(v)
    }
}
