//! Wire framing for protocol messages.
//!
//! Payloads are MessagePack (named fields) wrapped in a frame carrying the
//! length and a CRC32 of the bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

/// Maximum encoded message size
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub length: u32,
    pub checksum: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn encode<T: Serialize>(message: &T) -> Result<Self> {
        let data = rmp_serde::to_vec_named(message).map_err(|e| NodeError::Codec(e.to_string()))?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(NodeError::Codec(format!(
                "message too large: {} bytes (max {})",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        Ok(Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(&data),
            data,
        })
    }

    pub fn verify(&self) -> bool {
        self.length as usize == self.data.len() && crc32fast::hash(&self.data) == self.checksum
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.verify() {
            return Err(NodeError::Codec("checksum mismatch".to_string()));
        }
        rmp_serde::from_slice(&self.data).map_err(|e| NodeError::Codec(e.to_string()))
    }

    /// Frame as bytes: length and checksum (big endian) then the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.data.len());
        out.extend_from_slice(&self.length.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(NodeError::Codec("truncated frame header".to_string()));
        }
        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let checksum = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let data = bytes[8..].to_vec();
        if data.len() != length as usize {
            return Err(NodeError::Codec(format!(
                "frame length mismatch: header {} body {}",
                length,
                data.len()
            )));
        }
        Ok(Self {
            length,
            checksum,
            data,
        })
    }
}
