//! MessagePack request/reply codec.
//!
//! Requests and replies are msgpack maps with string keys. The request map
//! names its target in `function_name`; every other entry is an argument.

use rmpv::Value;

use crate::error::{DecodeError, DispatchError};
use crate::{CODE_FIELD, ERROR_FIELD, FUNCTION_NAME_FIELD};

/// Maximum nesting accepted while parsing a request.
pub const MAX_DECODE_DEPTH: usize = 16;

/// Named arguments of one request, in wire order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    entries: Vec<(String, Value)>,
}

impl Arguments {
    pub fn new(entries: Vec<(String, Value)>) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(name, _)| name == key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A decoded request, consumed once by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub function_name: String,
    pub arguments: Arguments,
}

/// Structured reply. Holds either a success payload or an `error` string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    fields: Vec<(String, Value)>,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new().with(ERROR_FIELD, message.into())
    }

    pub fn error_with_code(message: impl Into<String>, code: i32) -> Self {
        Self::error(message).with(CODE_FIELD, code)
    }

    /// Builder form of [`Reply::insert`].
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set `key`, replacing an existing entry.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| name == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(name, _)| name == key).map(|(_, value)| value)
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.str(ERROR_FIELD)
    }

    pub fn is_error(&self) -> bool {
        self.get(ERROR_FIELD).is_some()
    }

    pub fn code(&self) -> Option<i64> {
        self.get(CODE_FIELD).and_then(Value::as_i64)
    }

    pub fn to_value(&self) -> Value {
        Value::Map(
            self.fields
                .iter()
                .map(|(name, value)| (Value::from(name.as_str()), value.clone()))
                .collect(),
        )
    }
}

fn read_map(buffer: &[u8]) -> Result<Vec<(String, Value)>, DecodeError> {
    if buffer.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut cursor = buffer;
    let value = rmpv::decode::read_value_with_max_depth(&mut cursor, MAX_DECODE_DEPTH)?;
    if !cursor.is_empty() {
        return Err(DecodeError::TrailingBytes(cursor.len()));
    }
    let Value::Map(entries) = value else {
        return Err(DecodeError::NotAMap);
    };
    Ok(entries
        .into_iter()
        .filter_map(|(key, value)| match key {
            Value::String(name) => name.into_str().map(|name| (name, value)),
            other => {
                log::debug!("rpc: ignoring non-string map key {}", other);
                None
            }
        })
        .collect())
}

/// Parse one reassembled request buffer.
pub fn decode_request(buffer: &[u8], max_len: usize) -> Result<RpcRequest, DecodeError> {
    if buffer.len() > max_len {
        return Err(DecodeError::TooLarge { size: buffer.len(), max: max_len });
    }
    let mut entries = read_map(buffer)?;
    let position = entries
        .iter()
        .position(|(name, value)| name == FUNCTION_NAME_FIELD && value.is_str())
        .ok_or(DecodeError::MissingFunctionName)?;
    let (_, function_name) = entries.remove(position);
    let function_name =
        function_name.as_str().map(ToOwned::to_owned).ok_or(DecodeError::MissingFunctionName)?;
    Ok(RpcRequest { function_name, arguments: Arguments::new(entries) })
}

pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>, DispatchError> {
    Ok(rmp_serde::to_vec(&reply.to_value())?)
}

/// Encode a request as the companion application would send it.
pub fn request(
    function_name: &str,
    arguments: Vec<(&str, Value)>,
) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    let mut entries = Vec::with_capacity(arguments.len() + 1);
    entries.push((Value::from(FUNCTION_NAME_FIELD), Value::from(function_name)));
    entries.extend(arguments.into_iter().map(|(name, value)| (Value::from(name), value)));
    rmp_serde::to_vec(&Value::Map(entries))
}

/// Parse a reply buffer on the companion side.
pub fn decode_reply(buffer: &[u8]) -> Result<Reply, DecodeError> {
    Ok(Reply { fields: read_map(buffer)? })
}
