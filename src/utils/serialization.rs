// Thin wrappers around bincode 2 with the standard configuration. Wire
// payloads and the chain file both go through here so the encoding stays in
// one place.
use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};

/// Most bytes a single decode may claim. Length prefixes are read off the
/// wire, so without a limit a few bytes could ask for any allocation.
pub const MAX_DECODE_LEN: usize = 10 * 1024 * 1024;

pub fn serialize<T: Serialize + bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    let config = bincode::config::standard();
    bincode::encode_to_vec(data, config)
        .map_err(|e| LedgerError::Serialization(format!("Serialization failed: {e}")))
}

/// Decodes a value and rejects trailing bytes, so a frame or record can only
/// ever decode one way.
pub fn deserialize<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    let config = bincode::config::standard().with_limit::<MAX_DECODE_LEN>();
    let (data, read) = bincode::decode_from_slice(bytes, config)
        .map_err(|e| LedgerError::Serialization(format!("Deserialization failed: {e}")))?;
    if read != bytes.len() {
        return Err(LedgerError::Serialization(format!(
            "Deserialization left {} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(data)
}
