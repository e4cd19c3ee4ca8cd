mod codec;
mod types;

pub use codec::RespCodec;
pub use types::RespValue;

use bytes::Bytes;

/// Build the `CLUSTER NODES` query used for topology discovery.
pub fn new_cluster_nodes_cmd() -> RespValue {
    RespValue::Array(vec![
        RespValue::BulkString(Bytes::from_static(b"CLUSTER")),
        RespValue::BulkString(Bytes::from_static(b"NODES")),
    ])
}

/// Build an `AUTH <secret>` command.
pub fn new_auth_cmd(secret: &str) -> RespValue {
    RespValue::Array(vec![
        RespValue::BulkString(Bytes::from_static(b"AUTH")),
        RespValue::BulkString(Bytes::copy_from_slice(secret.as_bytes())),
    ])
}
