//! Worker output chunk codec.
//!
//! Workers reply with a self-describing packed value whose top level must be
//! a binary string; anything else is refused so serialized objects never
//! leak into the reply stream. The decode sits behind this one seam so
//! another packed codec can be plugged without touching the upstream.

use rmpv::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk is not a packed value: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("chunk failed to pack: {0}")]
    Encode(#[from] rmpv::encode::Error),

    #[error("chunk top level must be a binary string, got {kind}")]
    NotBinary { kind: &'static str },
}

/// Decode one worker output chunk into its raw payload bytes.
///
/// Trailing bytes after the value are tolerated; the runtime's stream
/// framing owns chunk boundaries.
pub fn decode_chunk(chunk: &[u8]) -> Result<Vec<u8>, ChunkError> {
    let mut cursor = chunk;
    match rmpv::decode::read_value(&mut cursor)? {
        Value::Binary(bytes) => Ok(bytes),
        Value::String(text) => Ok(text.as_bytes().to_vec()),
        other => Err(ChunkError::NotBinary {
            kind: kind_of(&other),
        }),
    }
}

/// Pack raw payload bytes the way a worker does. The other half of the
/// contract, used by in-process runtimes and tests.
pub fn encode_chunk(payload: &[u8]) -> Result<Vec<u8>, ChunkError> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    rmpv::encode::write_value(&mut out, &Value::Binary(payload.to_vec()))?;
    Ok(out)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "boolean",
        Value::Integer(_) => "integer",
        Value::F32(_) | Value::F64(_) => "float",
        Value::String(_) => "string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Ext(..) => "ext",
    }
}
