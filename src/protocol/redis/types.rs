use bytes::Bytes;

/// A RESP2 value as exchanged with cluster nodes.
///
/// The core only speaks the handful of frames needed for topology discovery
/// and authentication; anything richer belongs to the request layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Bytes),
    NullBulk,
    Array(Vec<RespValue>),
    NullArray,
}

impl RespValue {
    pub fn simple<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::SimpleString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn error<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::Error(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn bulk<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::BulkString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// The payload of a string-shaped reply, decoded as UTF-8 (lossy).
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::SimpleString(data)
            | RespValue::BulkString(data)
            | RespValue::Error(data) => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        }
    }
}
