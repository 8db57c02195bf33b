//! Frame layout: `[1 byte message id][0..n bytes msgpack payload]`.
//! A frame of only the id byte carries no payload.

use rmpv::Value;
use serde::Deserialize;

use crate::{error::CodecError, protocol::id::MessageId};

/// Encode a message into a wire frame.
///
/// # Errors
/// Returns [`CodecError::PayloadEncode`] if the payload cannot be serialized.
pub fn encode(id: MessageId, payload: Option<&Value>) -> Result<Vec<u8>, CodecError> {
    let mut frame = vec![id.as_u8()];
    if let Some(payload) = payload {
        rmpv::encode::write_value(&mut frame, payload)?;
    }
    Ok(frame)
}

/// Decode a wire frame into its message id and optional payload.
///
/// # Errors
/// - [`CodecError::MalformedFrame`] if the frame is empty or the id is unknown
/// - [`CodecError::PayloadDecode`] if the bytes after the id are not exactly one
///   msgpack value
pub fn decode(frame: &[u8]) -> Result<(MessageId, Option<Value>), CodecError> {
    let Some((&id, mut rest)) = frame.split_first() else {
        return Err(CodecError::MalformedFrame {
            details: "empty frame".to_string(),
        });
    };
    let id = MessageId::try_from(id)?;
    if rest.is_empty() {
        return Ok((id, None));
    }

    // rmpv's own reader takes the reserved 0xc1 marker for nil, the serde
    // decoder rejects it
    let payload = {
        let mut de = rmp_serde::Deserializer::new(&mut rest);
        Value::deserialize(&mut de).map_err(|e| CodecError::PayloadDecode {
            details: e.to_string(),
        })?
    };
    if !rest.is_empty() {
        return Err(CodecError::PayloadDecode {
            details: format!("{} trailing bytes after payload", rest.len()),
        });
    }
    Ok((id, Some(payload)))
}
