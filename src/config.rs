//! Configuration for RAID sets

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default RAID chunk size: 32KiB
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024;

/// Default native block size of members
pub const DEFAULT_NATIVE_BLOCK_SIZE: u32 = 512;

/// Default number of reusable in-flight request records per set
pub const DEFAULT_REQUEST_POOL_CAPACITY: usize = 16;

/// Configuration for a single RAID set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetConfig {
    /// Human-readable set name
    pub name: String,

    /// Declared member capacity of the set
    pub member_count: u32,

    /// RAID chunk size in bytes
    pub chunk_size: u64,

    /// Native block size of the members
    pub native_block_size: u32,

    /// Offset of the data region on each member
    pub base_offset: u64,

    /// Capacity of the in-flight request pool
    pub request_pool_capacity: usize,

    /// Optional hint describing the volume content
    pub content_hint: Option<String>,
}

impl SetConfig {
    /// Create a configuration with defaults for the given geometry
    pub fn new(name: impl Into<String>, member_count: u32) -> Self {
        SetConfig {
            name: name.into(),
            member_count,
            chunk_size: DEFAULT_CHUNK_SIZE,
            native_block_size: DEFAULT_NATIVE_BLOCK_SIZE,
            base_offset: 0,
            request_pool_capacity: DEFAULT_REQUEST_POOL_CAPACITY,
            content_hint: None,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("set name must not be empty".to_string()));
        }
        if self.member_count == 0 {
            return Err(Error::Config("member_count must be > 0".to_string()));
        }
        if self.native_block_size == 0 {
            return Err(Error::Config("native_block_size must be > 0".to_string()));
        }
        if self.chunk_size == 0 || self.chunk_size % self.native_block_size as u64 != 0 {
            return Err(Error::Config(format!(
                "chunk_size ({}) must be a positive multiple of native_block_size ({})",
                self.chunk_size, self.native_block_size
            )));
        }
        if self.request_pool_capacity == 0 {
            return Err(Error::Config(
                "request_pool_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
