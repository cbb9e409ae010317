//! Low-level marshalling with D-Bus alignment rules
//!
//! Offsets are relative to the start of the buffer being written or read.
//! Message headers and bodies both start on an 8-byte boundary, so each can
//! be marshalled on its own without knowing its final position.

use crate::{parse_signature, ProtocolError, Type, Value};
use bytes::{BufMut, BytesMut};

/// Maximum byte length of a single array
pub const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

/// Maximum nesting of variants and containers while decoding
const MAX_NESTING: usize = 64;

/// Little-endian marshaller
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Create an empty encoder
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Number of bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write zero bytes until the offset is a multiple of `alignment`
    pub fn align(&mut self, alignment: usize) {
        let padding = padding_for(self.buf.len(), alignment);
        self.buf.put_bytes(0, padding);
    }

    /// Marshal one value
    pub fn write_value(&mut self, value: &Value) -> Result<(), ProtocolError> {
        match value {
            Value::Byte(v) => self.buf.put_u8(*v),
            Value::Boolean(v) => {
                self.align(4);
                self.buf.put_u32_le(u32::from(*v));
            }
            Value::Int16(v) => {
                self.align(2);
                self.buf.put_i16_le(*v);
            }
            Value::Uint16(v) => {
                self.align(2);
                self.buf.put_u16_le(*v);
            }
            Value::Int32(v) => {
                self.align(4);
                self.buf.put_i32_le(*v);
            }
            Value::Uint32(v) | Value::UnixFd(v) => {
                self.align(4);
                self.buf.put_u32_le(*v);
            }
            Value::Int64(v) => {
                self.align(8);
                self.buf.put_i64_le(*v);
            }
            Value::Uint64(v) => {
                self.align(8);
                self.buf.put_u64_le(*v);
            }
            Value::Double(v) => {
                self.align(8);
                self.buf.put_f64_le(*v);
            }
            Value::String(s) | Value::ObjectPath(s) => self.write_string(s)?,
            Value::Signature(s) => self.write_signature(s)?,
            Value::Variant(inner) => {
                self.write_signature(&inner.value_type().signature())?;
                self.write_value(inner)?;
            }
            Value::Array(element, items) => self.write_array(element, items)?,
            Value::Struct(fields) => {
                self.align(8);
                for field in fields {
                    self.write_value(field)?;
                }
            }
            Value::DictEntry(key, value) => {
                self.align(8);
                self.write_value(key)?;
                self.write_value(value)?;
            }
        }
        Ok(())
    }

    /// Consume the encoder and return the marshalled bytes
    pub fn finish(self) -> BytesMut {
        self.buf
    }

    fn write_string(&mut self, s: &str) -> Result<(), ProtocolError> {
        if s.as_bytes().contains(&0) {
            return Err(ProtocolError::invalid("string contains a nul byte"));
        }
        let len = u32::try_from(s.len())
            .map_err(|_| ProtocolError::invalid("string length exceeds u32"))?;
        self.align(4);
        self.buf.put_u32_le(len);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    fn write_signature(&mut self, signature: &str) -> Result<(), ProtocolError> {
        let len = u8::try_from(signature.len())
            .map_err(|_| ProtocolError::InvalidSignature(signature.to_string()))?;
        self.buf.put_u8(len);
        self.buf.put_slice(signature.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    fn write_array(&mut self, element: &Type, items: &[Value]) -> Result<(), ProtocolError> {
        self.align(4);
        let len_at = self.buf.len();
        self.buf.put_u32_le(0);
        self.align(element.alignment());

        let start = self.buf.len();
        for item in items {
            if item.value_type() != *element {
                return Err(ProtocolError::invalid(format!(
                    "array of '{}' holds a '{}'",
                    element.signature(),
                    item.value_type().signature()
                )));
            }
            self.write_value(item)?;
        }

        let len = self.buf.len() - start;
        if len > MAX_ARRAY_LEN {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: MAX_ARRAY_LEN,
            });
        }
        // Length excludes the padding between the length word and the first element
        self.buf[len_at..len_at + 4].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(())
    }
}

/// Unmarshaller over a byte slice in either byte order
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    big_endian: bool,
    depth: usize,
}

impl<'a> Decoder<'a> {
    /// Create a decoder positioned at the start of `data`
    pub fn new(data: &'a [u8], big_endian: bool) -> Self {
        Self {
            data,
            pos: 0,
            big_endian,
            depth: 0,
        }
    }

    /// Current read offset
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Skip padding until the offset is a multiple of `alignment`
    pub fn align(&mut self, alignment: usize) -> Result<(), ProtocolError> {
        let padding = padding_for(self.pos, alignment);
        let skipped = self.take(padding)?;
        if skipped.iter().any(|b| *b != 0) {
            return Err(ProtocolError::invalid("non-zero padding"));
        }
        Ok(())
    }

    /// Unmarshal one value of the given type
    pub fn read_value(&mut self, ty: &Type) -> Result<Value, ProtocolError> {
        let value = match ty {
            Type::Byte => Value::Byte(self.take(1)?[0]),
            Type::Boolean => match self.read_u32()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => {
                    return Err(ProtocolError::invalid(format!("boolean value {other}")));
                }
            },
            Type::Int16 => {
                self.align(2)?;
                Value::Int16(i16::from_ne_bytes(self.fixed::<2>()?))
            }
            Type::Uint16 => {
                self.align(2)?;
                Value::Uint16(u16::from_ne_bytes(self.fixed::<2>()?))
            }
            Type::Int32 => {
                self.align(4)?;
                Value::Int32(i32::from_ne_bytes(self.fixed::<4>()?))
            }
            Type::Uint32 => Value::Uint32(self.read_u32()?),
            Type::UnixFd => Value::UnixFd(self.read_u32()?),
            Type::Int64 => {
                self.align(8)?;
                Value::Int64(i64::from_ne_bytes(self.fixed::<8>()?))
            }
            Type::Uint64 => {
                self.align(8)?;
                Value::Uint64(u64::from_ne_bytes(self.fixed::<8>()?))
            }
            Type::Double => {
                self.align(8)?;
                Value::Double(f64::from_ne_bytes(self.fixed::<8>()?))
            }
            Type::String => Value::String(self.read_string()?),
            Type::ObjectPath => Value::ObjectPath(self.read_string()?),
            Type::Signature => Value::Signature(self.read_signature()?),
            Type::Variant => {
                let signature = self.read_signature()?;
                let mut types = parse_signature(&signature)?;
                if types.len() != 1 {
                    return Err(ProtocolError::InvalidSignature(signature));
                }
                let inner = types.remove(0);
                Value::Variant(Box::new(self.nested(|d| d.read_value(&inner))?))
            }
            Type::Array(element) => {
                let len = self.read_u32()? as usize;
                if len > MAX_ARRAY_LEN {
                    return Err(ProtocolError::MessageTooLarge {
                        size: len,
                        max: MAX_ARRAY_LEN,
                    });
                }
                self.align(element.alignment())?;
                let end = self.pos + len;
                if end > self.data.len() {
                    return Err(ProtocolError::invalid("array runs past end of message"));
                }

                let mut items = Vec::new();
                while self.pos < end {
                    items.push(self.nested(|d| d.read_value(element))?);
                }
                if self.pos != end {
                    return Err(ProtocolError::invalid("array element crosses array end"));
                }
                Value::Array((**element).clone(), items)
            }
            Type::Struct(fields) => {
                self.align(8)?;
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(self.nested(|d| d.read_value(field))?);
                }
                Value::Struct(values)
            }
            Type::DictEntry(key, value) => {
                self.align(8)?;
                let key = self.nested(|d| d.read_value(key))?;
                let value = self.nested(|d| d.read_value(value))?;
                Value::DictEntry(Box::new(key), Box::new(value))
            }
        };
        Ok(value)
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        if self.depth >= MAX_NESTING {
            return Err(ProtocolError::invalid("values nested too deeply"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ProtocolError::invalid("unexpected end of data"))?;
        let data = self.data;
        let slice = &data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read `N` bytes and reorder them to native byte order
    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.take(N)?);
        if self.big_endian != cfg!(target_endian = "big") {
            bytes.reverse();
        }
        Ok(bytes)
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.align(4)?;
        Ok(u32::from_ne_bytes(self.fixed::<4>()?))
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        if self.take(1)?[0] != 0 {
            return Err(ProtocolError::invalid("string is not nul terminated"));
        }
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::invalid("string is not valid UTF-8"))
    }

    fn read_signature(&mut self) -> Result<String, ProtocolError> {
        let len = usize::from(self.take(1)?[0]);
        let bytes = self.take(len)?;
        if self.take(1)?[0] != 0 {
            return Err(ProtocolError::invalid("signature is not nul terminated"));
        }
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::invalid("signature is not valid ASCII"))
    }
}

/// Bytes of padding needed to move `offset` onto an `alignment` boundary
pub fn padding_for(offset: usize, alignment: usize) -> usize {
    (alignment - offset % alignment) % alignment
}
