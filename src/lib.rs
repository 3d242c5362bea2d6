//! raidvol - software RAID volume manager
//!
//! Owns a set of block-storage members, tracks their health, fans a single
//! logical I/O request out across the members through a pluggable level
//! policy, aggregates the per-member completions into one result, and
//! recovers automatically when a member fails mid-flight.

pub mod config;
pub mod error;
pub mod header;
pub mod manager;
pub mod member;
pub mod policy;
pub mod registry;
pub mod set;

pub use config::SetConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::SetConfig;
    pub use crate::error::{Error, Result};
    pub use crate::header::RaidHeader;
    pub use crate::manager::SetManager;
    pub use crate::member::{Member, MemberDevice, MemberState, MemoryMember};
    pub use crate::policy::{ConcatPolicy, LevelPolicy, MirrorPolicy, SubOp};
    pub use crate::registry::{DeviceRegistry, NullRegistry};
    pub use crate::set::{RaidSet, SetInfo, SetState, SetStatus, SetUpdate};
}
