//! Level policies: how a logical byte range maps onto members
//!
//! The core never encodes a RAID level. A [`LevelPolicy`] chosen at set
//! construction time plans which members participate in a request and which
//! byte range each of them sees. Two built-ins cover the simple levels;
//! striping and parity schemes plug in through the same trait.

use crate::member::MemberState;
use crate::set::MemberTable;

/// One per-member sub-operation planned for a request
///
/// A plan contains at most one sub-operation per member slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubOp {
    /// Table slot of the participating member
    pub slot: usize,
    /// Byte offset within the member's data region
    pub member_offset: u64,
    /// Byte offset within the caller's buffer
    pub buf_offset: usize,
    /// Bytes to transfer
    pub length: usize,
}

/// Pluggable mapping from logical byte ranges to member sub-operations
pub trait LevelPolicy: Send + Sync {
    /// Members participating in a read of `[start, start + length)`
    fn activate_read_members(&self, table: &MemberTable, start: u64, length: usize) -> Vec<SubOp>;

    /// Members participating in a write of `[start, start + length)`
    fn activate_write_members(&self, table: &MemberTable, start: u64, length: usize) -> Vec<SubOp>;

    /// Whether partial membership is still serviceable at this level
    ///
    /// Consulted on restart when the table is incomplete; accepting
    /// upgrades the set from Initializing to Degraded.
    fn degraded_ok(&self, active: usize, total: usize) -> bool {
        let _ = (active, total);
        false
    }

    /// Usable set capacity given the members' capacities
    fn set_capacity(&self, member_capacities: &[u64]) -> u64;
}

/// Concatenation: members are glued end to end, each covering a fixed span
pub struct ConcatPolicy {
    member_span: u64,
}

impl ConcatPolicy {
    /// Create a policy where each member covers `member_span` bytes
    pub fn new(member_span: u64) -> Self {
        ConcatPolicy { member_span }
    }

    fn plan(&self, table: &MemberTable, start: u64, length: usize) -> Vec<SubOp> {
        let mut ops = Vec::new();
        let end = start + length as u64;
        let mut pos = start;

        while pos < end {
            let slot = (pos / self.member_span) as usize;
            let member_offset = pos % self.member_span;
            let take = (self.member_span - member_offset).min(end - pos) as usize;

            // A missing slot is left out of the plan; the completion path
            // reports the shortfall as an underrun.
            if slot < table.member_count() && table.get(slot).is_some() {
                ops.push(SubOp {
                    slot,
                    member_offset,
                    buf_offset: (pos - start) as usize,
                    length: take,
                });
            }
            pos += take as u64;
        }
        ops
    }
}

impl LevelPolicy for ConcatPolicy {
    fn activate_read_members(&self, table: &MemberTable, start: u64, length: usize) -> Vec<SubOp> {
        self.plan(table, start, length)
    }

    fn activate_write_members(&self, table: &MemberTable, start: u64, length: usize) -> Vec<SubOp> {
        self.plan(table, start, length)
    }

    fn set_capacity(&self, member_capacities: &[u64]) -> u64 {
        self.member_span * member_capacities.len() as u64
    }
}

/// Mirroring: every member holds a full copy
pub struct MirrorPolicy;

impl MirrorPolicy {
    /// Create a mirror policy
    pub fn new() -> Self {
        MirrorPolicy
    }
}

impl Default for MirrorPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelPolicy for MirrorPolicy {
    fn activate_read_members(&self, table: &MemberTable, start: u64, length: usize) -> Vec<SubOp> {
        // Read from the first open copy
        let slot = table
            .iter_occupied()
            .find(|(_, m)| m.state() == MemberState::Open)
            .or_else(|| table.iter_occupied().next())
            .map(|(slot, _)| slot);

        match slot {
            Some(slot) => vec![SubOp {
                slot,
                member_offset: start,
                buf_offset: 0,
                length,
            }],
            None => Vec::new(),
        }
    }

    fn activate_write_members(&self, table: &MemberTable, start: u64, length: usize) -> Vec<SubOp> {
        table
            .iter_occupied()
            .map(|(slot, _)| SubOp {
                slot,
                member_offset: start,
                buf_offset: 0,
                length,
            })
            .collect()
    }

    fn degraded_ok(&self, active: usize, _total: usize) -> bool {
        active >= 1
    }

    fn set_capacity(&self, member_capacities: &[u64]) -> u64 {
        member_capacities.iter().copied().min().unwrap_or(0)
    }
}
