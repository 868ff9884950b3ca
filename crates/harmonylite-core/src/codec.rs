//! Self-describing binary encoding for [`ReplicationEnvelope`]s.
//!
//! Uses MessagePack ([`rmp_serde`]) rather than a schema-less format like
//! `postcard`: the wire format needs to stay self-describing so a decoder
//! never needs out-of-band knowledge of the payload shape, and MessagePack
//! carries its own type tags. An optional zstd frame wraps the MessagePack
//! bytes when the target stream is configured as compressed.

use crate::envelope::ReplicationEnvelope;
use crate::error::{HarmonyError, Result};

/// Encode an envelope to its wire representation, optionally wrapping the
/// MessagePack bytes in a zstd frame.
pub fn encode(envelope: &ReplicationEnvelope, compressed: bool) -> Result<Vec<u8>> {
    let packed = rmp_serde::to_vec_named(envelope)
        .map_err(|e| HarmonyError::Decode(format!("encode failed: {e}")))?;
    if compressed {
        zstd::encode_all(&packed[..], 0)
            .map_err(|e| HarmonyError::Decode(format!("zstd compress failed: {e}")))
    } else {
        Ok(packed)
    }
}

/// Decode a wire payload back into an envelope. `compressed` must match the
/// encoding used to produce `bytes` — subscribers infer this from the
/// stream name (the `-c` suffix), never by sniffing the payload.
pub fn decode(bytes: &[u8], compressed: bool) -> Result<ReplicationEnvelope> {
    let packed = if compressed {
        zstd::decode_all(bytes)
            .map_err(|e| HarmonyError::Decode(format!("zstd decompress failed: {e}")))?
    } else {
        bytes.to_vec()
    };
    rmp_serde::from_slice(&packed).map_err(|e| HarmonyError::Decode(format!("decode failed: {e}")))
}
