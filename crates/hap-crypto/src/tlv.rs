//! TLV8 encoding/decoding for HomeKit pairing messages.
//!
//! TLV8 format: [Type: 1 byte][Length: 1 byte][Value: 0-255 bytes]
//! Values longer than 255 bytes are fragmented across multiple records.

use std::collections::HashMap;

use hap_core::error::ParseError;

/// TLV type constants for HomeKit pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvType {
    Method = 0x00,
    Identifier = 0x01,
    Salt = 0x02,
    PublicKey = 0x03,
    Proof = 0x04,
    EncryptedData = 0x05,
    State = 0x06,
    Error = 0x07,
    RetryDelay = 0x08,
    Certificate = 0x09,
    Signature = 0x0A,
    Permissions = 0x0B,
    FragmentData = 0x0D,
    FragmentLast = 0x0E,
    Separator = 0xFF,
}

/// Parsed TLV8 message.
#[derive(Debug, Clone, Default)]
pub struct Tlv8 {
    items: HashMap<u8, Vec<u8>>,
}

impl Tlv8 {
    /// Create empty TLV8 message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TLV8 from bytes.
    ///
    /// Consecutive records with the same type are concatenated, which undoes
    /// the fragmentation applied to values longer than 255 bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut items: HashMap<u8, Vec<u8>> = HashMap::new();
        let mut i = 0;
        let mut last_type: Option<u8> = None;

        while i < data.len() {
            if i + 2 > data.len() {
                return Err(ParseError::InvalidFormat(
                    "TLV8: truncated header".to_string(),
                ));
            }

            let typ = data[i];
            let len = data[i + 1] as usize;
            i += 2;

            if i + len > data.len() {
                return Err(ParseError::InvalidFormat(format!(
                    "TLV8: truncated value (expected {} bytes, got {})",
                    len,
                    data.len() - i
                )));
            }

            let value = &data[i..i + len];
            i += len;

            if Some(typ) == last_type {
                if let Some(existing) = items.get_mut(&typ) {
                    existing.extend_from_slice(value);
                }
            } else {
                items
                    .entry(typ)
                    .or_insert_with(Vec::new)
                    .extend_from_slice(value);
            }

            last_type = Some(typ);
        }

        Ok(Self { items })
    }

    /// Encode to bytes, fragmenting values longer than 255 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut result = Vec::new();

        // Sort by type for deterministic output
        let mut types: Vec<_> = self.items.keys().collect();
        types.sort();

        for typ in types {
            let value = &self.items[typ];

            if value.is_empty() {
                result.push(*typ);
                result.push(0);
            } else {
                for chunk in value.chunks(255) {
                    result.push(*typ);
                    result.push(chunk.len() as u8);
                    result.extend_from_slice(chunk);
                }
            }
        }

        result
    }

    /// Get value for type.
    pub fn get(&self, typ: TlvType) -> Option<&[u8]> {
        self.items.get(&(typ as u8)).map(|v| v.as_slice())
    }

    /// Set value for type.
    pub fn set(&mut self, typ: TlvType, value: impl Into<Vec<u8>>) {
        self.items.insert(typ as u8, value.into());
    }

    /// Set a single-byte value for type.
    pub fn set_byte(&mut self, typ: TlvType, value: u8) {
        self.items.insert(typ as u8, vec![value]);
    }

    /// Check if type is present.
    pub fn contains(&self, typ: TlvType) -> bool {
        self.items.contains_key(&(typ as u8))
    }

    /// Get a single-byte value; the first byte wins for longer values.
    pub fn byte(&self, typ: TlvType) -> Option<u8> {
        self.get(typ).and_then(|v| v.first().copied())
    }

    /// Get the state value.
    pub fn state(&self) -> Option<u8> {
        self.byte(TlvType::State)
    }

    /// Get the error value.
    pub fn error(&self) -> Option<u8> {
        self.byte(TlvType::Error)
    }

    /// Get a value as a UTF-8 string.
    pub fn string(&self, typ: TlvType) -> Option<String> {
        self.get(typ)
            .and_then(|v| String::from_utf8(v.to_vec()).ok())
    }

    /// Error reply carrying the next expected state byte.
    pub fn error_reply(state: u8, code: u8) -> Self {
        let mut tlv = Self::new();
        tlv.set_byte(TlvType::State, state);
        tlv.set_byte(TlvType::Error, code);
        tlv
    }
}
