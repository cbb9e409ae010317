//! Message headers and bodies

use crate::{frame::Decoder, frame::Encoder, parse_signature, ProtocolError, Type, Value};
use bytes::Bytes;

/// Protocol version written in every header
const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed part of the header, before the field array
pub const FIXED_HEADER_LEN: usize = 16;

/// Flag: the sender does not want a reply
pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

/// Kind of message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Method call
    MethodCall,
    /// Successful reply
    MethodReturn,
    /// Error reply
    Error,
    /// Broadcast signal
    Signal,
}

impl MessageType {
    fn to_byte(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            other => Err(ProtocolError::invalid(format!("unknown message type {other}"))),
        }
    }
}

/// A complete D-Bus message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Kind of message
    pub message_type: MessageType,
    /// Header flags
    pub flags: u8,
    /// Sender-assigned serial, set by the connection when sending
    pub serial: u32,
    /// Object path
    pub path: Option<String>,
    /// Interface name
    pub interface: Option<String>,
    /// Method or signal name
    pub member: Option<String>,
    /// Error name for error replies
    pub error_name: Option<String>,
    /// Serial of the call this message answers
    pub reply_serial: Option<u32>,
    /// Destination bus name
    pub destination: Option<String>,
    /// Sender bus name
    pub sender: Option<String>,
    /// Body values, in signature order
    pub body: Vec<Value>,
}

impl Message {
    fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: 0,
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            body: Vec::new(),
        }
    }

    /// Create a method call
    pub fn method_call(
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            destination: Some(destination.into()),
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::empty(MessageType::MethodCall)
        }
    }

    /// Create a successful reply to `call`
    pub fn method_return(call: &Message, body: Vec<Value>) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            body,
            ..Self::empty(MessageType::MethodReturn)
        }
    }

    /// Create an error reply to `call`
    pub fn error(call: &Message, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(name.into()),
            body: vec![Value::String(text.into())],
            ..Self::empty(MessageType::Error)
        }
    }

    /// Replace the body
    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    /// Signature of the body
    pub fn signature(&self) -> String {
        self.body.iter().map(|v| v.value_type().signature()).collect()
    }

    /// Short description used in logs and errors
    pub fn describe(&self) -> String {
        format!(
            "{}.{}",
            self.interface.as_deref().unwrap_or("?"),
            self.member.as_deref().unwrap_or("?")
        )
    }

    /// Marshal into little-endian wire bytes
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut body = Encoder::new();
        for value in &self.body {
            body.write_value(value)?;
        }
        let body = body.finish();
        let body_len = u32::try_from(body.len())
            .map_err(|_| ProtocolError::invalid("body length exceeds u32"))?;

        let mut header = Encoder::new();
        header.write_value(&Value::Byte(b'l'))?;
        header.write_value(&Value::Byte(self.message_type.to_byte()))?;
        header.write_value(&Value::Byte(self.flags))?;
        header.write_value(&Value::Byte(PROTOCOL_VERSION))?;
        header.write_value(&Value::Uint32(body_len))?;
        header.write_value(&Value::Uint32(self.serial))?;
        header.write_value(&Value::Array(field_type(), self.header_fields()))?;
        header.align(8);

        let mut out = header.finish();
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    /// Unmarshal one complete message
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(ProtocolError::invalid("message shorter than fixed header"));
        }
        let big_endian = match data[0] {
            b'l' => false,
            b'B' => true,
            other => {
                return Err(ProtocolError::invalid(format!("unknown endianness {other:#x}")));
            }
        };

        let mut decoder = Decoder::new(data, big_endian);
        let fixed: Vec<u8> = (0..4)
            .map(|_| match decoder.read_value(&Type::Byte)? {
                Value::Byte(b) => Ok(b),
                _ => Err(ProtocolError::invalid("header byte")),
            })
            .collect::<Result<_, ProtocolError>>()?;
        if fixed[3] != PROTOCOL_VERSION {
            return Err(ProtocolError::invalid(format!(
                "unsupported protocol version {}",
                fixed[3]
            )));
        }

        let body_len = read_u32(&mut decoder)? as usize;
        let serial = read_u32(&mut decoder)?;
        if serial == 0 {
            return Err(ProtocolError::invalid("serial must be non-zero"));
        }

        let mut message = Self::empty(MessageType::from_byte(fixed[1])?);
        message.flags = fixed[2];
        message.serial = serial;

        let mut signature = String::new();
        let Value::Array(_, fields) = decoder.read_value(&Type::Array(Box::new(field_type())))?
        else {
            return Err(ProtocolError::invalid("header fields"));
        };
        for field in fields {
            let Value::Struct(mut parts) = field else {
                return Err(ProtocolError::invalid("header field"));
            };
            let (Some(Value::Variant(value)), Some(Value::Byte(code))) = (parts.pop(), parts.pop())
            else {
                return Err(ProtocolError::invalid("header field"));
            };
            match (code, *value) {
                (FIELD_PATH, Value::ObjectPath(v)) => message.path = Some(v),
                (FIELD_INTERFACE, Value::String(v)) => message.interface = Some(v),
                (FIELD_MEMBER, Value::String(v)) => message.member = Some(v),
                (FIELD_ERROR_NAME, Value::String(v)) => message.error_name = Some(v),
                (FIELD_REPLY_SERIAL, Value::Uint32(v)) => message.reply_serial = Some(v),
                (FIELD_DESTINATION, Value::String(v)) => message.destination = Some(v),
                (FIELD_SENDER, Value::String(v)) => message.sender = Some(v),
                (FIELD_SIGNATURE, Value::Signature(v)) => signature = v,
                (FIELD_UNIX_FDS, Value::Uint32(_)) => {
                    return Err(ProtocolError::invalid("unix fd passing is not supported"));
                }
                (
                    FIELD_PATH | FIELD_INTERFACE | FIELD_MEMBER | FIELD_ERROR_NAME
                    | FIELD_REPLY_SERIAL | FIELD_DESTINATION | FIELD_SENDER | FIELD_SIGNATURE,
                    other,
                ) => {
                    return Err(ProtocolError::invalid(format!(
                        "header field {code} has type '{}'",
                        other.value_type().signature()
                    )));
                }
                // Unknown fields must be ignored
                _ => {}
            }
        }
        decoder.align(8)?;

        let body_start = decoder.position();
        let body = data
            .get(body_start..body_start + body_len)
            .ok_or_else(|| ProtocolError::invalid("body runs past end of message"))?;
        if body_start + body_len != data.len() {
            return Err(ProtocolError::invalid("trailing bytes after body"));
        }

        let mut body_decoder = Decoder::new(body, big_endian);
        for ty in parse_signature(&signature)? {
            message.body.push(body_decoder.read_value(&ty)?);
        }
        if body_decoder.remaining() != 0 {
            return Err(ProtocolError::invalid("body longer than its signature"));
        }

        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let ok = match self.message_type {
            MessageType::MethodCall => self.path.is_some() && self.member.is_some(),
            MessageType::MethodReturn => self.reply_serial.is_some(),
            MessageType::Error => self.reply_serial.is_some() && self.error_name.is_some(),
            MessageType::Signal => {
                self.path.is_some() && self.interface.is_some() && self.member.is_some()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(ProtocolError::invalid(format!(
                "{:?} is missing a required header field",
                self.message_type
            )))
        }
    }

    fn header_fields(&self) -> Vec<Value> {
        let mut fields = Vec::new();
        let mut push = |code: u8, value: Value| {
            fields.push(Value::Struct(vec![
                Value::Byte(code),
                Value::Variant(Box::new(value)),
            ]));
        };

        if let Some(path) = &self.path {
            push(FIELD_PATH, Value::ObjectPath(path.clone()));
        }
        if let Some(interface) = &self.interface {
            push(FIELD_INTERFACE, Value::String(interface.clone()));
        }
        if let Some(member) = &self.member {
            push(FIELD_MEMBER, Value::String(member.clone()));
        }
        if let Some(error_name) = &self.error_name {
            push(FIELD_ERROR_NAME, Value::String(error_name.clone()));
        }
        if let Some(reply_serial) = self.reply_serial {
            push(FIELD_REPLY_SERIAL, Value::Uint32(reply_serial));
        }
        if let Some(destination) = &self.destination {
            push(FIELD_DESTINATION, Value::String(destination.clone()));
        }
        if let Some(sender) = &self.sender {
            push(FIELD_SENDER, Value::String(sender.clone()));
        }
        if !self.body.is_empty() {
            push(FIELD_SIGNATURE, Value::Signature(self.signature()));
        }
        fields
    }
}

fn field_type() -> Type {
    Type::Struct(vec![Type::Byte, Type::Variant])
}

fn read_u32(decoder: &mut Decoder<'_>) -> Result<u32, ProtocolError> {
    match decoder.read_value(&Type::Uint32)? {
        Value::Uint32(v) => Ok(v),
        _ => Err(ProtocolError::invalid("expected u32")),
    }
}
