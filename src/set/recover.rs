//! Background recovery: detect and evict failed members
//!
//! Recovery runs on its own task, racing against live I/O and against
//! concurrent destroys. It pauses the set optimistically, drains in-flight
//! requests, evicts every member caught in the Closing state, and restarts
//! the set with the reduced membership before any evicted member is
//! actually closed, so the restart decision always sees a consistent
//! snapshot.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::member::MemberState;
use crate::set::RaidSet;

impl RaidSet {
    /// Kick off background recovery
    ///
    /// The pause is taken optimistically before the hand-off; if the
    /// worker cannot be spawned the pause is undone immediately so no
    /// orphaned pause survives.
    pub(crate) fn recover_start(&self) {
        self.pause_depth.send_modify(|d| *d += 1);
        let set = match self.strong_handle() {
            Some(set) => set,
            None => {
                self.unpause();
                return;
            }
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    set.recover().await;
                });
            }
            Err(e) => {
                warn!(set = %self.uuid(), error = %e, "recovery hand-off failed");
                drop(set);
                self.unpause();
            }
        }
    }

    /// Recovery worker: drain, evict Closing members, restart if needed
    ///
    /// Returns whether the set still has any active members.
    pub(crate) async fn recover(self: Arc<Self>) -> bool {
        debug!(set = %self.uuid(), "recovery worker running");

        // a concurrent destroy/replace may have raced ahead of us
        let authoritative = match self.owning_manager() {
            Some(manager) => manager.is_authoritative(&self),
            None => true, // standalone sets answer for themselves
        };
        if !authoritative {
            debug!(set = %self.uuid(), "set no longer authoritative, recovery aborted");
            self.unpause();
            return false;
        }

        // wait for in-flight requests to drain; new allocations are
        // already blocked by our pause
        {
            let mut pending = self.pending.subscribe();
            let _ = pending.wait_for(|p| *p == 0).await;
        }

        let mut core = self.core.lock().await;
        let mut evicted = Vec::new();
        for slot in 0..core.table.member_count() {
            let closing = core
                .table
                .get(slot)
                .map(|m| m.state() == MemberState::Closing)
                .unwrap_or(false);
            if closing {
                if let Some(member) = core.table.clear_slot(slot) {
                    warn!(
                        set = %self.uuid(),
                        member = %member.uuid(),
                        slot,
                        "evicting failed member to spare pool"
                    );
                    member.set_state(MemberState::Broken);
                    core.spares.push(member.clone());
                    evicted.push(member);
                }
            }
        }

        if !evicted.is_empty() {
            // the active count changed: restart with the reduced
            // membership before any evicted member closes
            if let Err(e) = self.start_locked(&mut core).await {
                error!(set = %self.uuid(), error = %e, "restart after eviction failed");
            }
        }
        let has_members = core.table.active_count() > 0;
        drop(core);

        for member in evicted {
            if let Err(e) = member.device().close().await {
                debug!(member = %member.uuid(), error = %e, "close after eviction failed");
            }
        }

        self.unpause();
        has_members
    }
}
