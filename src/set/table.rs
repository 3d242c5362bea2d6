//! Member table and spare pool
//!
//! The table maps logical indexes to attached members. Its backing storage
//! is distinct from its declared size: shrinking only retracts the declared
//! size and regrowing within previously allocated slots reuses them, so
//! membership edits that oscillate around a working size never reallocate.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::member::{Member, MemberState};

/// Fixed-capacity, resizable array of member slots
pub struct MemberTable {
    /// Backing slots; length is the allocated capacity
    slots: Vec<Option<Arc<Member>>>,
    /// Declared member capacity, `<= slots.len()`
    member_count: usize,
    /// Slots currently occupied
    active_count: usize,
}

impl MemberTable {
    /// Create an empty table with no allocated slots
    pub fn new() -> Self {
        MemberTable {
            slots: Vec::new(),
            member_count: 0,
            active_count: 0,
        }
    }

    /// Declared member capacity
    pub fn member_count(&self) -> usize {
        self.member_count
    }

    /// Number of occupied slots
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    /// Allocated backing capacity (never shrinks)
    pub fn allocated(&self) -> usize {
        self.slots.len()
    }

    /// Whether every declared slot is occupied
    pub fn is_complete(&self) -> bool {
        self.active_count == self.member_count
    }

    /// Member at the given slot, if occupied
    pub fn get(&self, slot: usize) -> Option<&Arc<Member>> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Install a member into an empty slot
    pub fn set(&mut self, slot: usize, member: Arc<Member>) -> Result<()> {
        if slot >= self.member_count {
            return Err(Error::Member(format!(
                "logical index {} outside declared capacity {}",
                slot, self.member_count
            )));
        }
        if self.slots[slot].is_some() {
            return Err(Error::DuplicateIndex(slot));
        }
        self.slots[slot] = Some(member);
        self.active_count += 1;
        Ok(())
    }

    /// Empty the given slot, returning its member
    pub fn clear_slot(&mut self, slot: usize) -> Option<Arc<Member>> {
        let member = self.slots.get_mut(slot).and_then(|s| s.take());
        if member.is_some() {
            self.active_count -= 1;
        }
        member
    }

    /// Empty every slot, returning the members in slot order
    pub fn take_all(&mut self) -> Vec<Arc<Member>> {
        let members: Vec<_> = self.slots.iter_mut().filter_map(|s| s.take()).collect();
        self.active_count = 0;
        members
    }

    /// Slot holding the member with the given identity
    pub fn find(&self, uuid: Uuid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map(|m| m.uuid() == uuid).unwrap_or(false))
    }

    /// Iterate occupied slots in index order
    pub fn iter_occupied(&self) -> impl Iterator<Item = (usize, &Arc<Member>)> {
        self.slots
            .iter()
            .enumerate()
            .take(self.member_count)
            .filter_map(|(i, s)| s.as_ref().map(|m| (i, m)))
    }

    /// Identities of occupied slots in index order
    pub fn member_uuids(&self) -> Vec<Uuid> {
        self.iter_occupied().map(|(_, m)| m.uuid()).collect()
    }

    /// Change the declared capacity, returning any displaced members
    ///
    /// Shrinking clears slots beyond `new_count` and lowers the declared
    /// size; the backing storage is retained. Growing back within the
    /// retained allocation is a metadata update. Only growing beyond the
    /// allocated capacity extends the backing storage.
    pub fn resize(&mut self, new_count: usize) -> Vec<Arc<Member>> {
        let mut displaced = Vec::new();

        if new_count < self.member_count {
            for slot in new_count..self.member_count {
                if let Some(member) = self.clear_slot(slot) {
                    displaced.push(member);
                }
            }
        } else if new_count > self.slots.len() {
            self.slots.resize_with(new_count, || None);
        }

        debug!(
            from = self.member_count,
            to = new_count,
            allocated = self.slots.len(),
            "member table resized"
        );
        self.member_count = new_count;
        displaced
    }
}

impl Default for MemberTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Attached-but-inactive members awaiting promotion
pub struct SparePool {
    members: Vec<Arc<Member>>,
}

impl SparePool {
    /// Create an empty pool
    pub fn new() -> Self {
        SparePool {
            members: Vec::new(),
        }
    }

    /// Attach a member to the pool
    ///
    /// A member already present (by identity) is not duplicated.
    pub fn push(&mut self, member: Arc<Member>) {
        if !self.contains(member.uuid()) {
            self.members.push(member);
        }
    }

    /// Detach the member with the given identity
    pub fn remove(&mut self, uuid: Uuid) -> Option<Arc<Member>> {
        let index = self.members.iter().position(|m| m.uuid() == uuid)?;
        Some(self.members.swap_remove(index))
    }

    /// Whether a member with the given identity is attached
    pub fn contains(&self, uuid: Uuid) -> bool {
        self.members.iter().any(|m| m.uuid() == uuid)
    }

    /// Number of attached spares
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Spares that are not broken, candidates for promotion
    pub fn usable(&self) -> impl Iterator<Item = &Arc<Member>> {
        self.members
            .iter()
            .filter(|m| m.state() == MemberState::Spare)
    }

    /// Detach every member
    pub fn drain(&mut self) -> Vec<Arc<Member>> {
        std::mem::take(&mut self.members)
    }
}

impl Default for SparePool {
    fn default() -> Self {
        Self::new()
    }
}
