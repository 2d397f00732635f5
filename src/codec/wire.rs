//! bincode configuration shared by the record codec and the dump format.
//!
//! Fixed-width little-endian integers, `u64` length prefixes, a presence
//! byte for options. Decoding rejects trailing bytes so a padded buffer is as
//! corrupt as a short one.

use crate::{Error, Result};
use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Appends the encoding of `value` to `out`.
pub(crate) fn encode_into<T: Serialize + ?Sized>(
    out: &mut Vec<u8>,
    value: &T,
    what: &str,
) -> Result<()> {
    options()
        .serialize_into(out, value)
        .map_err(|e| Error::OperationFailed {
            operation: format!("encode_{what}"),
            cause: e.to_string(),
        })
}

/// Encodes `value` on its own.
pub(crate) fn encode<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_into(&mut out, value, what)?;
    Ok(out)
}

/// Decodes exactly one `T` from `bytes`.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8], kind: &str) -> Result<T> {
    options()
        .deserialize(bytes)
        .map_err(|e| Error::CorruptRecord {
            kind: kind.to_string(),
            reason: e.to_string(),
        })
}
