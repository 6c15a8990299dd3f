//! Shared binary codec for durable records.

use betula_common::Result;
use bincode::config::{AllowTrailing, FixintEncoding, WithOtherIntEncoding, WithOtherTrailing};
use bincode::{DefaultOptions, Options};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::LazyLock;

static BINCODER: LazyLock<
    WithOtherIntEncoding<WithOtherTrailing<DefaultOptions, AllowTrailing>, FixintEncoding>,
> = LazyLock::new(|| {
    bincode::DefaultOptions::new()
        .allow_trailing_bytes()
        .with_fixint_encoding()
});

/// Serializes a value with the store-wide codec.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(BINCODER.serialize(value)?)
}

/// Deserializes a value with the store-wide codec.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(BINCODER.deserialize(bytes)?)
}
