//! Serde helpers that encode raw bytes as `0x`-prefixed hex strings.

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
	S: Serializer,
{
	serializer.serialize_str(&encode(bytes))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
	D: Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;
	decode(&value).map_err(serde::de::Error::custom)
}

/// Encodes bytes as a `0x`-prefixed lowercase hex string.
pub fn encode(bytes: &[u8]) -> String {
	format!("0x{}", hex::encode(bytes))
}

/// Decodes a hex string, with or without the `0x` prefix.
pub fn decode(value: &str) -> Result<Vec<u8>, hex::FromHexError> {
	hex::decode(value.strip_prefix("0x").unwrap_or(value))
}
