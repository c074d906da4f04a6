//! Wire envelope for fabric messages.
//!
//! A fixed 64-byte little-endian header followed by the payload. The
//! header carries its own checksum over the first 60 bytes and a
//! payload checksum, both truncated SHA-256, so corruption is caught
//! before any payload parsing.

use crate::error::{FabricError, Result};
use crate::types::{NodeId, SequenceNumber};
use sha2::{Digest, Sha256};

/// Envelope magic, "TEND" read as a little-endian u32.
pub const ENVELOPE_MAGIC: u32 = 0x444E_4554;

/// Current wire version.
pub const ENVELOPE_VERSION: u16 = 1;

/// Fixed header length in bytes.
pub const HEADER_LENGTH: usize = 64;

/// Largest accepted payload.
pub const MAX_PAYLOAD_LENGTH: usize = 16 * 1024 * 1024;

/// Destination ID meaning "all nodes".
pub const BROADCAST_DEST: NodeId = u64::MAX;

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageKind {
    /// Point-to-point agent message.
    Direct = 1,
    /// Fan-out to every active node.
    Broadcast = 2,
    /// Liveness probe.
    Heartbeat = 3,
    /// Consensus RPC payload.
    Consensus = 4,
    /// Fabric control traffic (join, leave, transfer).
    Control = 5,
}

impl MessageKind {
    fn from_u16(value: u16) -> Result<Self> {
        match value {
            1 => Ok(MessageKind::Direct),
            2 => Ok(MessageKind::Broadcast),
            3 => Ok(MessageKind::Heartbeat),
            4 => Ok(MessageKind::Consensus),
            5 => Ok(MessageKind::Control),
            other => Err(FabricError::InvalidEnvelope(format!(
                "unknown message kind {other}"
            ))),
        }
    }
}

/// A decoded fabric message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub flags: u32,
    pub source: NodeId,
    pub dest: NodeId,
    pub sequence: SequenceNumber,
    /// Sender clock, milliseconds since the epoch.
    pub timestamp_ms: u64,
    /// Random per-message identifier for correlation.
    pub message_id: u32,
    /// Number of logical messages in the payload; 0 and 1 both mean one.
    pub batch_size: u16,
    /// Delivery priority, 0 is highest.
    pub priority: u8,
    pub payload: Vec<u8>,
}

/// First 4 bytes of the SHA-256 of `data`, little-endian.
fn checksum(data: &[u8]) -> u32 {
    let digest = Sha256::digest(data);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

impl Envelope {
    pub fn new(
        kind: MessageKind,
        source: NodeId,
        dest: NodeId,
        sequence: SequenceNumber,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            flags: 0,
            source,
            dest,
            sequence,
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
            message_id: rand::random(),
            batch_size: 1,
            priority: 0,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest == BROADCAST_DEST
    }

    /// Serialize to header plus payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(FabricError::InvalidEnvelope(format!(
                "payload length {} exceeds maximum {}",
                self.payload.len(),
                MAX_PAYLOAD_LENGTH
            )));
        }

        let mut buf = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        buf.extend_from_slice(&ENVELOPE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&ENVELOPE_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.kind as u16).to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.source.to_le_bytes());
        buf.extend_from_slice(&self.dest.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&checksum(&self.payload).to_le_bytes());
        buf.extend_from_slice(&self.message_id.to_le_bytes());
        buf.extend_from_slice(&self.batch_size.to_le_bytes());
        buf.push(self.priority);
        buf.push(0); // reserved

        debug_assert_eq!(buf.len(), HEADER_LENGTH - 4);
        let header_checksum = checksum(&buf);
        buf.extend_from_slice(&header_checksum.to_le_bytes());

        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse and validate an encoded envelope.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LENGTH {
            return Err(FabricError::InvalidEnvelope(format!(
                "truncated header: {} bytes",
                data.len()
            )));
        }

        let magic = read_u32(data, 0);
        if magic != ENVELOPE_MAGIC {
            return Err(FabricError::InvalidEnvelope(format!(
                "bad magic {magic:#010x}"
            )));
        }

        let version = read_u16(data, 4);
        if version != ENVELOPE_VERSION {
            return Err(FabricError::InvalidEnvelope(format!(
                "unsupported version {version}"
            )));
        }

        // Header integrity before trusting any length field.
        let stored_header_checksum = read_u32(data, HEADER_LENGTH - 4);
        let computed = checksum(&data[..HEADER_LENGTH - 4]);
        if stored_header_checksum != computed {
            return Err(FabricError::ChecksumMismatch {
                expected: stored_header_checksum,
                actual: computed,
            });
        }

        let kind = MessageKind::from_u16(read_u16(data, 6))?;
        let flags = read_u32(data, 8);
        let source = read_u64(data, 12);
        let dest = read_u64(data, 20);
        let sequence = read_u64(data, 28);
        let timestamp_ms = read_u64(data, 36);
        let payload_len = read_u32(data, 44) as usize;
        let payload_checksum = read_u32(data, 48);
        let message_id = read_u32(data, 52);
        let batch_size = read_u16(data, 56);
        let priority = data[58];

        if payload_len > MAX_PAYLOAD_LENGTH {
            return Err(FabricError::InvalidEnvelope(format!(
                "declared payload length {payload_len} exceeds maximum"
            )));
        }
        if data.len() != HEADER_LENGTH + payload_len {
            return Err(FabricError::InvalidEnvelope(format!(
                "expected {} bytes, got {}",
                HEADER_LENGTH + payload_len,
                data.len()
            )));
        }

        let payload = data[HEADER_LENGTH..].to_vec();
        let actual = checksum(&payload);
        if actual != payload_checksum {
            return Err(FabricError::ChecksumMismatch {
                expected: payload_checksum,
                actual,
            });
        }

        Ok(Self {
            kind,
            flags,
            source,
            dest,
            sequence,
            timestamp_ms,
            message_id,
            batch_size,
            priority,
            payload,
        })
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
