//! On-disk header record for RAID sets
//!
//! Each member carries a copy of the set header. The core treats the header
//! as a versioned key/value bag: it reads the fields below, writes back an
//! updated sequence number and membership list on reconfiguration, and
//! round-trips any fields it does not understand.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SetConfig;

/// Header format version understood by this build
pub const HEADER_VERSION: u32 = 2;

/// Set header as stored on every member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaidHeader {
    /// Human-readable set name
    pub name: String,
    /// Set identity
    pub uuid: Uuid,
    /// Identities of the members composing the set, by logical index
    pub member_uuids: Vec<Uuid>,
    /// Logical index of the member this copy was read from
    pub member_index: u32,
    /// Header format version
    pub header_version: u32,
    /// Monotonically increasing header generation
    pub sequence_number: u64,
    /// RAID chunk size in bytes
    pub chunk_size: u64,
    /// Declared member capacity of the set
    pub member_count: u32,
    /// Offset of the data region on each member
    pub base_offset: u64,
    /// Native block size of the members
    pub native_block_size: u32,
    /// Optional hint describing the volume content
    pub content_hint: Option<String>,
    /// Fields written by other versions, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RaidHeader {
    /// Create a fresh header for a new set
    pub fn new(config: &SetConfig, uuid: Uuid) -> Self {
        RaidHeader {
            name: config.name.clone(),
            uuid,
            member_uuids: Vec::new(),
            member_index: 0,
            header_version: HEADER_VERSION,
            sequence_number: 0,
            chunk_size: config.chunk_size,
            member_count: config.member_count,
            base_offset: config.base_offset,
            native_block_size: config.native_block_size,
            content_hint: config.content_hint.clone(),
            extra: serde_json::Map::new(),
        }
    }

    /// Derive the header copy for one member slot
    pub fn member_header(&self, member_index: u32) -> Self {
        let mut header = self.clone();
        header.member_index = member_index;
        header
    }

    /// Record a new membership list
    pub fn set_membership(&mut self, member_uuids: Vec<Uuid>) {
        self.member_uuids = member_uuids;
    }

    /// Advance the header generation
    pub fn bump_sequence(&mut self) -> u64 {
        self.sequence_number += 1;
        self.sequence_number
    }
}
