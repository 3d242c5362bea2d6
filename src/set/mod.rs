//! RAID set core: member table, state machine, request pool, recovery
//!
//! The set owns its members, fans logical I/O out across them through the
//! level policy, aggregates per-member completions into one result, and
//! recovers in the background when a member fails mid-flight.

mod raid_set;
mod recover;
mod request;
mod state;
mod table;

pub use raid_set::{RaidSet, SetInfo, SetUpdate};
pub use request::{IoCompletion, IoDirection, MemberOutcome, RequestPool, StorageRequest};
pub use state::{next_state, SetState, SetStatus};
pub use table::{MemberTable, SparePool};
