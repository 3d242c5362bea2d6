//! The RAID set: membership, I/O fan-out, aggregation, and quiescence
//!
//! All set-mutating operations (membership edits, state transitions, pool
//! allocation and return, pause/unpause) run inside one serialization
//! domain per set, the `core` mutex. Completion callbacks and the recovery
//! worker run on their own tasks and re-enter that domain before touching
//! shared state. Blocking operations wait on named conditions: the
//! pause-depth channel, the pending-request channel, and the request
//! pool's availability signal. Every allocator retries those conditions in
//! the same fixed order (no-medium check, pause, then pool) so two
//! concurrent reconfigurations cannot deadlock against each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SetConfig;
use crate::error::{Error, Result};
use crate::header::RaidHeader;
use crate::manager::SetManager;
use crate::member::{Member, MemberDevice, MemberState};
use crate::policy::{LevelPolicy, SubOp};
use crate::registry::DeviceRegistry;
use crate::set::request::{
    IoCompletion, IoDirection, MemberOutcome, RequestPool, StorageRequest,
};
use crate::set::state::{next_state, SetState, SetStatus};
use crate::set::table::{MemberTable, SparePool};

/// State shared inside the set's serialization domain
pub(crate) struct SetCore {
    pub(crate) header: RaidHeader,
    pub(crate) state: SetState,
    pub(crate) table: MemberTable,
    pub(crate) spares: SparePool,
    pub(crate) started: bool,
}

/// A software RAID set
///
/// Created quiesced: I/O submitted before [`RaidSet::start`] waits on the
/// pause condition. `start` assembles the membership, opens members,
/// builds the request pool, and releases the initial pause.
pub struct RaidSet {
    me: Weak<RaidSet>,
    config: SetConfig,
    uuid: Uuid,
    policy: Arc<dyn LevelPolicy>,
    registry: Arc<dyn DeviceRegistry>,
    manager: parking_lot::Mutex<Weak<SetManager>>,
    pub(crate) core: Mutex<SetCore>,
    pub(crate) pool: RequestPool,
    /// Re-entrant pause counter; I/O is permitted at zero
    pub(crate) pause_depth: watch::Sender<u32>,
    /// Requests currently checked out of the pool
    pub(crate) pending: watch::Sender<usize>,
    status_tx: watch::Sender<SetStatus>,
    capacity: AtomicU64,
    /// Header copy written by a parent set when this set is stacked
    stacked_header: parking_lot::Mutex<Option<RaidHeader>>,
}

/// Snapshot of a set's externally interesting state
#[derive(Debug, Clone, Serialize)]
pub struct SetInfo {
    pub name: String,
    pub uuid: Uuid,
    pub state: SetState,
    pub status: SetStatus,
    pub member_count: usize,
    pub active_count: usize,
    pub spare_count: usize,
    pub sequence_number: u64,
    pub pending_requests: usize,
    pub paused: bool,
}

/// Membership changes applied atomically by [`RaidSet::reconfigure`]
#[derive(Default)]
pub struct SetUpdate {
    /// New declared member capacity
    pub member_count: Option<u32>,
    /// Members to detach, by identity
    pub remove: Vec<Uuid>,
    /// Members to install into table slots
    pub add_members: Vec<Arc<Member>>,
    /// Members to attach as spares
    pub add_spares: Vec<Arc<Member>>,
}

impl RaidSet {
    /// Create a new, quiesced set
    pub fn new(
        config: SetConfig,
        policy: Arc<dyn LevelPolicy>,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let uuid = Uuid::new_v4();
        let header = RaidHeader::new(&config, uuid);
        let mut table = MemberTable::new();
        table.resize(config.member_count as usize);
        let pool = RequestPool::new(config.request_pool_capacity, config.member_count as usize);

        let (pause_depth, _) = watch::channel(1u32); // created quiesced
        let (pending, _) = watch::channel(0usize);
        let (status_tx, _) = watch::channel(SetStatus::Offline);

        info!(set = %config.name, %uuid, members = config.member_count, "set created");

        Ok(Arc::new_cyclic(|me| RaidSet {
            me: me.clone(),
            config,
            uuid,
            policy,
            registry,
            manager: parking_lot::Mutex::new(Weak::new()),
            core: Mutex::new(SetCore {
                header,
                state: SetState::Initializing,
                table,
                spares: SparePool::new(),
                started: false,
            }),
            pool,
            pause_depth,
            pending,
            status_tx,
            capacity: AtomicU64::new(0),
            stacked_header: parking_lot::Mutex::new(None),
        }))
    }

    /// Set identity
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Set name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current externally visible status
    pub fn status(&self) -> SetStatus {
        *self.status_tx.borrow()
    }

    /// Observe status changes
    pub fn watch_status(&self) -> watch::Receiver<SetStatus> {
        self.status_tx.subscribe()
    }

    /// Snapshot of the set header
    pub async fn header(&self) -> RaidHeader {
        self.core.lock().await.header.clone()
    }

    /// Member occupying the given slot
    pub async fn member_at(&self, slot: usize) -> Option<Arc<Member>> {
        self.core.lock().await.table.get(slot).cloned()
    }

    /// Target state a healthy reconfiguration would move to
    pub async fn next_state(&self) -> SetState {
        let core = self.core.lock().await;
        next_state(
            core.table.active_count(),
            core.table.member_count(),
            core.spares.is_empty(),
        )
    }

    /// Snapshot of the set's current shape
    pub async fn info(&self) -> SetInfo {
        let core = self.core.lock().await;
        SetInfo {
            name: core.header.name.clone(),
            uuid: self.uuid,
            state: core.state,
            status: core.state.status(),
            member_count: core.table.member_count(),
            active_count: core.table.active_count(),
            spare_count: core.spares.len(),
            sequence_number: core.header.sequence_number,
            pending_requests: *self.pending.borrow(),
            paused: *self.pause_depth.borrow() > 0,
        }
    }

    pub(crate) fn attach_manager(&self, manager: Weak<SetManager>) {
        *self.manager.lock() = manager;
    }

    /// Owned handle to this set, for hand-offs to background workers
    pub(crate) fn strong_handle(&self) -> Option<Arc<RaidSet>> {
        self.me.upgrade()
    }

    pub(crate) fn owning_manager(&self) -> Option<Arc<SetManager>> {
        self.manager.lock().upgrade()
    }

    /// Apply a state transition; illegal transitions are no-ops
    ///
    /// On acceptance the externally visible status is updated, observers
    /// are notified, and the registry hooks fire.
    fn change_state_locked(&self, core: &mut SetCore, target: SetState) -> bool {
        if !core.state.can_transition_to(target) {
            debug!(
                set = %core.header.name,
                from = ?core.state,
                to = ?target,
                "state transition rejected"
            );
            return false;
        }
        if core.state == target {
            return true;
        }

        info!(set = %core.header.name, from = ?core.state, to = ?target, "set state change");
        core.state = target;

        let status = target.status();
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });

        match status {
            SetStatus::Online | SetStatus::Degraded => self.registry.publish(
                &core.header.name,
                self.uuid,
                self.capacity.load(Ordering::Relaxed),
            ),
            SetStatus::Offline => self.registry.unpublish(self.uuid),
        }
        true
    }

    // ---- membership -----------------------------------------------------

    /// Install a member into its declared table slot
    pub async fn add_member(&self, member: Arc<Member>) -> Result<()> {
        let mut core = self.core.lock().await;
        self.add_member_locked(&mut core, member)
    }

    fn add_member_locked(&self, core: &mut SetCore, member: Arc<Member>) -> Result<()> {
        if member.is_broken() {
            return Err(Error::Member("member is broken".to_string()));
        }
        if core.spares.contains(member.uuid()) {
            // retry with a refreshed header copy; detach from the spares first
            core.spares.remove(member.uuid());
            member.set_state(MemberState::Closed);
        } else if member.state() == MemberState::Spare {
            member.set_state(MemberState::Broken);
            return Err(Error::Member("member is already a spare".to_string()));
        }
        if member.state() != MemberState::Closed {
            let state = member.state();
            member.set_state(MemberState::Broken);
            return Err(Error::Member(format!("member is {:?}, not closed", state)));
        }
        if core.table.find(member.uuid()).is_some() {
            // one device, one slot, no matter what index its header claims
            member.set_state(MemberState::Broken);
            return Err(Error::Member(
                "identity already occupies a table slot".to_string(),
            ));
        }
        if core.table.active_count() >= core.table.member_count() {
            member.set_state(MemberState::Broken);
            return Err(Error::Member("set already has full membership".to_string()));
        }
        if core.state.is_operational() && *self.pause_depth.borrow() == 0 {
            member.set_state(MemberState::Broken);
            return Err(Error::Member(
                "set is live; pause it before editing membership".to_string(),
            ));
        }

        if member.header_version() != core.header.header_version {
            // incompatible on-disk format: the whole set goes down
            error!(
                set = %core.header.name,
                member = %member.uuid(),
                member_version = member.header_version(),
                set_version = core.header.header_version,
                "header version mismatch, failing set"
            );
            let err = Error::HeaderVersionMismatch {
                member: member.header_version(),
                set: core.header.header_version,
            };
            member.set_state(MemberState::Broken);
            self.change_state_locked(core, SetState::Failed);
            return Err(err);
        }

        let member_seq = member.sequence_number();
        let set_seq = core.header.sequence_number;
        if member_seq < set_seq {
            // stale copy; recoverable by retrying with a fresher one
            warn!(
                member = %member.uuid(),
                member_seq,
                set_seq,
                "member header is stale, demoting to spare"
            );
            member.set_state(MemberState::Spare);
            core.spares.push(member);
            return Err(Error::StaleSequence {
                member: member_seq,
                set: set_seq,
            });
        }
        if member_seq > set_seq {
            // the member carries a fresher generation than our view:
            // discard our membership and adopt its header
            info!(
                set = %core.header.name,
                member = %member.uuid(),
                member_seq,
                set_seq,
                "adopting newer header generation"
            );
            for evicted in core.table.take_all() {
                evicted.set_state(MemberState::Spare);
                core.spares.push(evicted);
            }
            let adopted = member.header();
            core.header.sequence_number = adopted.sequence_number;
            core.header.member_uuids = adopted.member_uuids.clone();
            core.header.chunk_size = adopted.chunk_size;
            core.header.base_offset = adopted.base_offset;
            core.header.native_block_size = adopted.native_block_size;
            core.header.content_hint = adopted.content_hint.clone();
            if adopted.member_count as usize != core.table.member_count() {
                for displaced in core.table.resize(adopted.member_count as usize) {
                    displaced.set_state(MemberState::Spare);
                    core.spares.push(displaced);
                }
            }
            core.header.member_count = adopted.member_count;
        }

        let slot = member.member_index() as usize;
        if slot >= core.table.member_count() {
            member.set_state(MemberState::Broken);
            return Err(Error::Member(format!(
                "logical index {} outside declared capacity {}",
                slot,
                core.table.member_count()
            )));
        }
        if core.table.get(slot).is_some() {
            // two members claiming one slot means the headers lie;
            // administrator territory
            error!(
                set = %core.header.name,
                member = %member.uuid(),
                slot,
                "duplicate logical index, failing set"
            );
            member.set_state(MemberState::Broken);
            self.change_state_locked(core, SetState::Failed);
            return Err(Error::DuplicateIndex(slot));
        }

        debug!(set = %core.header.name, member = %member.uuid(), slot, "member attached");
        core.table.set(slot, member)
    }

    /// Detach a member, whether active or spare
    pub async fn remove_member(&self, uuid: Uuid) -> Result<()> {
        let mut core = self.core.lock().await;
        if let Some(slot) = core.table.find(uuid) {
            if let Some(member) = core.table.clear_slot(slot) {
                debug!(set = %core.header.name, member = %uuid, slot, "member detached");
                self.close_member(&member).await;
                return Ok(());
            }
        }
        if let Some(member) = core.spares.remove(uuid) {
            debug!(set = %core.header.name, member = %uuid, "spare detached");
            self.close_member(&member).await;
            return Ok(());
        }
        Err(Error::UnknownMember(uuid))
    }

    /// Attach a member to the spare pool
    pub async fn add_spare(&self, member: Arc<Member>) -> Result<()> {
        let mut core = self.core.lock().await;
        if member.is_broken() {
            return Err(Error::Member("member is broken".to_string()));
        }
        if core.table.find(member.uuid()).is_some() {
            return Err(Error::Member(
                "identity already occupies a table slot".to_string(),
            ));
        }
        if !matches!(member.state(), MemberState::Closed | MemberState::Spare) {
            let state = member.state();
            member.set_state(MemberState::Broken);
            return Err(Error::Member(format!(
                "member is {:?}, cannot become a spare",
                state
            )));
        }
        member.set_state(MemberState::Spare);
        debug!(set = %core.header.name, member = %member.uuid(), "spare attached");
        core.spares.push(member);
        Ok(())
    }

    /// Change the declared member capacity
    ///
    /// Displaced members are demoted to spares. Requires the set to be
    /// paused (or not yet serving), like any membership edit.
    pub async fn resize(&self, new_count: u32) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.state.is_operational() && *self.pause_depth.borrow() == 0 {
            return Err(Error::Member(
                "set is live; pause it before resizing".to_string(),
            ));
        }
        for displaced in core.table.resize(new_count as usize) {
            displaced.set_state(MemberState::Spare);
            core.spares.push(displaced);
        }
        core.header.member_count = new_count;
        Ok(())
    }

    async fn close_member(&self, member: &Arc<Member>) {
        if matches!(member.state(), MemberState::Open | MemberState::Closing) {
            member.set_state(MemberState::Closing);
            if let Err(e) = member.device().close().await {
                warn!(member = %member.uuid(), error = %e, "member close failed");
            }
        }
        member.set_state(MemberState::Closed);
    }

    // ---- lifecycle ------------------------------------------------------

    /// Assemble the membership and begin serving I/O
    ///
    /// Restarting a set that is already serving requires it to be paused
    /// first; the request pool is rebuilt on start and must not have
    /// records checked out.
    pub async fn start(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.started && *self.pause_depth.borrow() == 0 {
            return Err(Error::Member(
                "set is live; pause it before restarting".to_string(),
            ));
        }
        let result = self.start_locked(&mut core).await;
        if !core.started {
            core.started = true;
            drop(core);
            // release the construction pause even on failure so blocked
            // allocators fail fast instead of hanging
            self.unpause();
        }
        result
    }

    /// Start or restart the set; the caller must hold the set quiesced
    pub(crate) async fn start_locked(&self, core: &mut SetCore) -> Result<()> {
        if !self.change_state_locked(core, SetState::Initializing) {
            return Err(Error::SetFailed);
        }

        // open attached members that are not open yet
        let members: Vec<(usize, Arc<Member>)> = core
            .table
            .iter_occupied()
            .map(|(slot, m)| (slot, m.clone()))
            .collect();
        let mut failed_slots = Vec::new();
        for (slot, member) in &members {
            if member.state() == MemberState::Closed {
                match member.device().open().await {
                    Ok(header) => {
                        member.update_header(header);
                        member.set_state(MemberState::Open);
                    }
                    Err(e) => {
                        warn!(member = %member.uuid(), error = %e, "member open failed");
                        failed_slots.push(*slot);
                    }
                }
            }
        }
        for slot in failed_slots {
            if let Some(member) = core.table.clear_slot(slot) {
                member.set_state(MemberState::Broken);
                core.spares.push(member);
            }
        }

        let member_capacities: Vec<u64> = core
            .table
            .iter_occupied()
            .map(|(_, m)| m.device().capacity().saturating_sub(core.header.base_offset))
            .collect();
        self.capacity.store(
            self.policy.set_capacity(&member_capacities),
            Ordering::Relaxed,
        );

        // the request pool is drained and rebuilt on every restart
        self.pool.rebuild(core.table.member_count());

        let mut target = next_state(
            core.table.active_count(),
            core.table.member_count(),
            core.spares.is_empty(),
        );
        if target == SetState::Initializing
            && core.table.active_count() > 0
            && self
                .policy
                .degraded_ok(core.table.active_count(), core.table.member_count())
        {
            target = SetState::Degraded;
        }
        if !self.change_state_locked(core, target) {
            return Err(Error::SetFailed);
        }

        if target == SetState::Online && core.table.is_complete() {
            // healthy full-membership restart: advance the header
            // generation and write it back to every member
            core.header.bump_sequence();
            core.header.set_membership(core.table.member_uuids());
            let open_members: Vec<(usize, Arc<Member>)> = core
                .table
                .iter_occupied()
                .map(|(slot, m)| (slot, m.clone()))
                .collect();
            for (slot, member) in open_members {
                let header = core.header.member_header(slot as u32);
                member.update_header(header.clone());
                if let Err(e) = member.device().write_header(&header).await {
                    warn!(member = %member.uuid(), error = %e, "header write-back failed");
                }
            }
            debug!(
                set = %core.header.name,
                sequence = core.header.sequence_number,
                "membership sealed"
            );
        }
        Ok(())
    }

    /// Tear the set down and detach every member
    pub async fn destroy(&self) -> Result<()> {
        let started = { self.core.lock().await.started };
        if started {
            self.pause(false).await;
        }

        let mut core = self.core.lock().await;
        info!(set = %core.header.name, "destroying set");
        self.change_state_locked(&mut core, SetState::Terminating);
        let members = core.table.take_all();
        let spares = core.spares.drain();
        drop(core);

        for member in members.into_iter().chain(spares) {
            self.close_member(&member).await;
        }

        if let Some(manager) = self.owning_manager() {
            manager.forget(self.uuid);
        }
        // wake blocked allocators; they fail fast with NoMedium now
        self.unpause();
        Ok(())
    }

    /// Pause, apply membership edits, restart, unpause
    pub async fn reconfigure(&self, update: SetUpdate) -> Result<()> {
        {
            let core = self.core.lock().await;
            if !core.started {
                return Err(Error::NotStarted);
            }
            if core.state == SetState::Failed {
                return Err(Error::SetFailed);
            }
        }

        self.pause(false).await;
        let mut result = Ok(());
        if let Some(count) = update.member_count {
            result = self.resize(count).await;
        }
        for uuid in update.remove {
            if result.is_ok() {
                result = self.remove_member(uuid).await;
            }
        }
        for member in update.add_members {
            if result.is_ok() {
                result = self.add_member(member).await;
            }
        }
        for member in update.add_spares {
            if result.is_ok() {
                result = self.add_spare(member).await;
            }
        }
        // restart with whatever membership we now have
        let restart = {
            let mut core = self.core.lock().await;
            self.start_locked(&mut core).await
        };
        self.unpause();
        result.and(restart)
    }

    // ---- quiescence -----------------------------------------------------

    /// Pause the set, draining in-flight requests
    ///
    /// With `when_idle`, the call is a no-op reporting `false` if any I/O
    /// is pending or another pause is already in effect. Otherwise the
    /// caller waits its turn behind any current pauser, raises the pause
    /// depth, and blocks until the pending count reaches zero.
    pub async fn pause(&self, when_idle: bool) -> bool {
        loop {
            let core = self.core.lock().await;
            if when_idle
                && (*self.pending.borrow() > 0 || *self.pause_depth.borrow() > 0)
            {
                return false;
            }
            if *self.pause_depth.borrow() > 0 {
                // one pauser at a time; wait for the current one to finish
                let mut depth = self.pause_depth.subscribe();
                drop(core);
                if depth.wait_for(|d| *d == 0).await.is_err() {
                    return false;
                }
                continue;
            }
            self.pause_depth.send_modify(|d| *d += 1);
            drop(core);
            break;
        }

        // drain: pause condition settled above, now wait on pending
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|p| *p == 0).await;
        debug!(set = %self.config.name, "set paused and drained");
        true
    }

    /// Drop one level of pause; at zero, blocked allocators wake
    pub fn unpause(&self) {
        self.pause_depth.send_modify(|d| {
            if *d > 0 {
                *d -= 1;
            } else {
                warn!(set = %self.config.name, "unpause without matching pause");
            }
        });
    }

    // ---- I/O ------------------------------------------------------------

    /// Read `length` bytes starting at `offset`
    pub async fn read(&self, offset: u64, length: usize) -> Result<Bytes> {
        let rx = self.submit(offset, length, IoDirection::Read, None).await?;
        let completion = rx
            .await
            .map_err(|_| Error::Internal("request completion dropped".to_string()))?;
        completion.status?;
        Ok(completion.data.unwrap_or_default())
    }

    /// Write `data` starting at `offset`, returning the bytes written
    pub async fn write(&self, offset: u64, data: Bytes) -> Result<u64> {
        let length = data.len();
        let rx = self
            .submit(offset, length, IoDirection::Write, Some(data))
            .await?;
        let completion = rx
            .await
            .map_err(|_| Error::Internal("request completion dropped".to_string()))?;
        completion.status?;
        Ok(completion.bytes)
    }

    async fn submit(
        &self,
        offset: u64,
        length: usize,
        direction: IoDirection,
        data: Option<Bytes>,
    ) -> Result<oneshot::Receiver<IoCompletion>> {
        let mut request = self.allocate_request().await?;
        let (tx, rx) = oneshot::channel();

        let core = self.core.lock().await;
        request.prepare(offset, length, direction, core.table.member_count(), tx);
        let plan = match direction {
            IoDirection::Read => self.policy.activate_read_members(&core.table, offset, length),
            IoDirection::Write => self
                .policy
                .activate_write_members(&core.table, offset, length),
        };
        request.expected_bytes = plan.iter().map(|op| op.length as u64).sum();
        // snapshot the participants while the table is stable
        let participants: Vec<(Arc<Member>, SubOp)> = plan
            .iter()
            .filter_map(|op| core.table.get(op.slot).map(|m| (m.clone(), *op)))
            .collect();
        request.plan = plan;
        let base_offset = core.header.base_offset;
        drop(core);

        match self.me.upgrade() {
            Some(set) => {
                tokio::spawn(async move {
                    set.run_request(request, participants, data, base_offset).await;
                });
                Ok(rx)
            }
            None => {
                self.return_request(request);
                Err(Error::Internal("set is shutting down".to_string()))
            }
        }
    }

    /// Check a request record out of the pool, blocking under backpressure
    ///
    /// The wait order is fixed on every retry: fail fast when the set has
    /// nothing to serve with, then the pause condition, then the pool's
    /// availability condition.
    async fn allocate_request(&self) -> Result<Box<StorageRequest>> {
        loop {
            let core = self.core.lock().await;
            if core.state == SetState::Failed {
                // fatal conditions stop new I/O immediately, members or not
                return Err(Error::SetFailed);
            }
            if core.table.active_count() == 0
                && core.state.rank() <= SetState::Terminating.rank()
            {
                return Err(Error::NoMedium);
            }
            if *self.pause_depth.borrow() > 0 {
                let mut depth = self.pause_depth.subscribe();
                drop(core);
                if depth.wait_for(|d| *d == 0).await.is_err() {
                    return Err(Error::NoMedium);
                }
                continue;
            }
            match self.pool.try_take() {
                Some(request) => {
                    self.pending.send_modify(|p| *p += 1);
                    return Ok(request);
                }
                None => {
                    // register before releasing the lock so a concurrent
                    // return cannot be missed
                    let available = self.pool.notified();
                    drop(core);
                    available.await;
                    continue;
                }
            }
        }
    }

    /// Return a request record and wake one blocked allocator
    fn return_request(&self, request: Box<StorageRequest>) {
        self.pending.send_modify(|p| {
            if *p > 0 {
                *p -= 1;
            }
        });
        self.pool.put_back(request);
    }

    async fn run_request(
        self: Arc<Self>,
        mut request: Box<StorageRequest>,
        participants: Vec<(Arc<Member>, SubOp)>,
        data: Option<Bytes>,
        base_offset: u64,
    ) {
        let direction = request.direction;
        let sub_ops = participants.into_iter().map(|(member, op)| {
            let payload = data
                .as_ref()
                .map(|d| d.slice(op.buf_offset..op.buf_offset + op.length));
            async move {
                if member.state() != MemberState::Open {
                    return (op.slot, MemberOutcome::Skipped, 0u64, None);
                }
                let device_offset = base_offset + op.member_offset;
                match direction {
                    IoDirection::Read => {
                        match member.device().read_at(device_offset, op.length).await {
                            Ok(bytes) => {
                                let n = bytes.len() as u64;
                                (op.slot, MemberOutcome::Success, n, Some(bytes))
                            }
                            Err(e) => {
                                warn!(member = %member.uuid(), error = %e, "member read failed");
                                if member.state() == MemberState::Open {
                                    member.set_state(MemberState::Closing);
                                }
                                (op.slot, MemberOutcome::Failed(e), 0, None)
                            }
                        }
                    }
                    IoDirection::Write => {
                        let payload = payload.unwrap_or_default();
                        match member.device().write_at(device_offset, payload).await {
                            Ok(n) => (op.slot, MemberOutcome::Success, n, None),
                            Err(e) => {
                                warn!(member = %member.uuid(), error = %e, "member write failed");
                                if member.state() == MemberState::Open {
                                    member.set_state(MemberState::Closing);
                                }
                                (op.slot, MemberOutcome::Failed(e), 0, None)
                            }
                        }
                    }
                }
            }
        });

        // sub-operations may complete in any order; the aggregation scan
        // below does not care
        for (slot, outcome, bytes, payload) in join_all(sub_ops).await {
            request.record(slot, outcome, bytes, payload);
        }
        self.complete_request(request).await;
    }

    /// Aggregate per-member outcomes into one set-level result
    pub(crate) async fn complete_request(&self, mut request: Box<StorageRequest>) {
        let mut status: Result<()> = Ok(());
        let mut transferred: u64 = 0;

        let core = self.core.lock().await;
        let width = request.member_status.len().min(core.table.member_count());
        for slot in 0..width {
            // a missing slot is not an error; the level policy planned
            // around it
            let member = match core.table.get(slot) {
                Some(m) => m,
                None => continue,
            };
            let outcome =
                std::mem::replace(&mut request.member_status[slot], MemberOutcome::Skipped);
            if let MemberOutcome::Failed(error) = outcome {
                // first error wins for reporting; keep scanning
                if status.is_ok() {
                    status = Err(error);
                }
                continue;
            }
            match member.state() {
                MemberState::Open => {}
                MemberState::Closing => {
                    // soft signal: a member dropped out mid-request
                    if status.is_ok() {
                        status = Err(Error::Offline);
                    }
                    continue;
                }
                _ => continue, // not open: ignored for byte-counting
            }
            if matches!(outcome, MemberOutcome::Success) && status.is_ok() {
                // bytes only count while the aggregate is still clean
                transferred += request.member_bytes[slot];
            }
        }

        let mut payload = None;
        if status.is_ok() {
            if transferred != request.expected_bytes {
                // all-or-nothing: a short set-level transfer is an error
                status = Err(Error::Underrun {
                    expected: request.expected_bytes,
                    transferred,
                });
            } else if plan_coverage(&request.plan) < request.length {
                // the plan left part of the caller's range unserved
                // (missing slots); that shortfall is an underrun even
                // though every planned sub-operation succeeded
                status = Err(Error::Underrun {
                    expected: request.length as u64,
                    transferred,
                });
            } else if request.direction == IoDirection::Read {
                payload = Some(assemble_read(&request));
            }
        }

        let failed = status.is_err();
        // the caller sees all-or-nothing: full logical length or zero
        let bytes = if failed { 0 } else { request.length as u64 };
        debug!(
            set = %self.config.name,
            offset = request.offset,
            length = request.length,
            failed,
            "request aggregated"
        );
        let completion = request.completion.take();
        self.return_request(request);
        drop(core);

        // the caller hears the verdict before recovery touches anything
        if let Some(tx) = completion {
            let _ = tx.send(IoCompletion {
                status,
                bytes,
                data: payload,
            });
        }

        if failed {
            // member eviction is a side effect of I/O failure
            self.recover_start();
        }
    }

    // ---- cache-sync barrier ---------------------------------------------

    /// Flush caches across every open member, nested sets included
    ///
    /// All flushes are issued concurrently; the barrier releases when
    /// every member has answered. The first failure is reported.
    pub async fn synchronize_cache(&self) -> Result<()> {
        let members: Vec<Arc<Member>> = {
            let core = self.core.lock().await;
            core.table
                .iter_occupied()
                .filter(|(_, m)| m.state() == MemberState::Open)
                .map(|(_, m)| m.clone())
                .collect()
        };
        let expected = members.len();

        let results = join_all(members.iter().map(|m| m.device().flush())).await;
        let mut completed = 0usize;
        let mut status: Result<()> = Ok(());
        for (member, result) in members.iter().zip(results) {
            match result {
                Ok(()) => completed += 1,
                Err(e) => {
                    warn!(member = %member.uuid(), error = %e, "cache sync failed");
                    if status.is_ok() {
                        status = Err(e);
                    }
                }
            }
        }
        debug!(set = %self.config.name, completed, expected, "cache sync barrier released");
        status
    }
}

/// Bytes of the caller's buffer the plan actually covers
///
/// Mirror plans overlap (every sub-operation covers the whole range);
/// concatenation plans tile it. Counting the union handles both.
fn plan_coverage(plan: &[SubOp]) -> usize {
    let mut spans: Vec<(usize, usize)> = plan
        .iter()
        .map(|op| (op.buf_offset, op.buf_offset + op.length))
        .collect();
    spans.sort_unstable();

    let mut covered = 0;
    let mut reach = 0;
    for (start, end) in spans {
        if end > reach {
            covered += end - start.max(reach);
            reach = end;
        }
    }
    covered
}

fn assemble_read(request: &StorageRequest) -> Bytes {
    let mut out = BytesMut::zeroed(request.length);
    for op in &request.plan {
        if let Some(Some(data)) = request.member_data.get(op.slot) {
            let end = (op.buf_offset + data.len()).min(out.len());
            if op.buf_offset < end {
                out[op.buf_offset..end].copy_from_slice(&data[..end - op.buf_offset]);
            }
        }
    }
    out.freeze()
}

/// Sets stack: a whole set can serve as a member of another set
#[async_trait]
impl MemberDevice for RaidSet {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    async fn open(&self) -> Result<RaidHeader> {
        self.stacked_header
            .lock()
            .clone()
            .ok_or_else(|| Error::Io("stacked set has no header copy".to_string()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes> {
        self.read(offset, length).await
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> Result<u64> {
        self.write(offset, data).await
    }

    async fn flush(&self) -> Result<()> {
        self.synchronize_cache().await
    }

    async fn write_header(&self, header: &RaidHeader) -> Result<()> {
        *self.stacked_header.lock() = Some(header.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemoryMember;
    use crate::policy::{ConcatPolicy, MirrorPolicy};
    use crate::registry::NullRegistry;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::{sleep, timeout};

    const MEMBER_CAPACITY: usize = 4096;

    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn mirror_set(member_count: u32) -> Arc<RaidSet> {
        RaidSet::new(
            SetConfig::new("mirror", member_count),
            Arc::new(MirrorPolicy::new()),
            Arc::new(NullRegistry),
        )
        .unwrap()
    }

    fn concat_set(member_count: u32, span: u64) -> Arc<RaidSet> {
        RaidSet::new(
            SetConfig::new("concat", member_count),
            Arc::new(ConcatPolicy::new(span)),
            Arc::new(NullRegistry),
        )
        .unwrap()
    }

    async fn new_member(set: &RaidSet, index: u32) -> (Arc<MemoryMember>, Arc<Member>) {
        let header = set.header().await.member_header(index);
        let device = MemoryMember::with_header(MEMBER_CAPACITY, header.clone());
        let member = Member::new(device.clone(), header);
        (device, member)
    }

    async fn wait_for_active_count(set: &RaidSet, count: usize) {
        timeout(Duration::from_secs(5), async {
            loop {
                if set.info().await.active_count == count {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("membership never settled");
    }

    #[tokio::test]
    async fn test_two_members_assemble_online() {
        let set = mirror_set(2);
        let (_, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;

        set.add_member(m0).await.unwrap();
        set.add_member(m1).await.unwrap();

        let info = set.info().await;
        assert_eq!(info.active_count, 2);
        assert!(info.active_count <= info.member_count);
        assert_eq!(set.next_state().await, SetState::Online);

        set.start().await.unwrap();
        assert_eq!(set.status(), SetStatus::Online);
        let info = set.info().await;
        assert_eq!(info.state, SetState::Online);
        assert_eq!(info.sequence_number, 1);
        assert!(!info.paused);
    }

    #[tokio::test]
    async fn test_concat_read_write_roundtrip() {
        let set = concat_set(2, 1024);
        let (_, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;
        set.add_member(m0).await.unwrap();
        set.add_member(m1).await.unwrap();
        set.start().await.unwrap();

        // range crossing the member boundary
        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        let written = set.write(900, Bytes::from(payload.clone())).await.unwrap();
        assert_eq!(written, 200);

        let read = set.read(900, 200).await.unwrap();
        assert_eq!(&read[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_stale_member_demoted_to_spare_then_retried() {
        let set = mirror_set(2);
        let (_, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;
        let stale_header = set.header().await.member_header(0); // sequence 0
        set.add_member(m0.clone()).await.unwrap();
        set.add_member(m1).await.unwrap();
        set.start().await.unwrap(); // sequence now 1

        assert!(set.pause(false).await);
        set.remove_member(m0.uuid()).await.unwrap();

        let stale_device = MemoryMember::with_header(MEMBER_CAPACITY, stale_header.clone());
        let stale = Member::new(stale_device, stale_header);
        let err = set.add_member(stale.clone()).await.unwrap_err();
        assert!(matches!(err, Error::StaleSequence { member: 0, set: 1 }));
        assert_eq!(stale.state(), MemberState::Spare);
        assert_eq!(set.info().await.spare_count, 1);

        // retry with a refreshed header copy succeeds
        stale.update_header(set.header().await.member_header(0));
        set.add_member(stale).await.unwrap();
        assert_eq!(set.info().await.active_count, 2);
        assert_eq!(set.info().await.spare_count, 0);
        set.unpause();
    }

    #[tokio::test]
    async fn test_newer_member_header_is_adopted() {
        let set = mirror_set(2);
        let (_, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;
        set.add_member(m0).await.unwrap();
        set.add_member(m1.clone()).await.unwrap();
        set.start().await.unwrap(); // sequence 1

        assert!(set.pause(false).await);
        set.remove_member(m1.uuid()).await.unwrap();

        let mut fresh = set.header().await.member_header(1);
        fresh.sequence_number = 5;
        let newcomer = Member::new(
            MemoryMember::with_header(MEMBER_CAPACITY, fresh.clone()),
            fresh,
        );
        set.add_member(newcomer.clone()).await.unwrap();
        set.unpause();

        let info = set.info().await;
        assert_eq!(info.sequence_number, 5);
        assert_eq!(info.active_count, 1);
        // the previously active member was evicted to the spare pool
        assert_eq!(info.spare_count, 1);
        let installed = set.member_at(1).await.unwrap();
        assert_eq!(installed.uuid(), newcomer.uuid());
    }

    #[tokio::test]
    async fn test_header_version_mismatch_fails_set() {
        let set = mirror_set(2);
        let mut header = set.header().await.member_header(0);
        header.header_version = 1; // this build writes v2
        let odd = Member::new(
            MemoryMember::with_header(MEMBER_CAPACITY, header.clone()),
            header,
        );

        let err = set.add_member(odd.clone()).await.unwrap_err();
        assert!(matches!(err, Error::HeaderVersionMismatch { member: 1, set: 2 }));
        assert!(odd.is_broken());
        assert_eq!(set.info().await.state, SetState::Failed);

        // a failed set refuses to start: forward-only rule
        let err = set.start().await.unwrap_err();
        assert!(matches!(err, Error::SetFailed));
        assert_eq!(set.status(), SetStatus::Offline);
    }

    #[tokio::test]
    async fn test_duplicate_logical_index_fails_set() {
        let set = mirror_set(2);
        let (_, first) = new_member(&set, 0).await;
        let (_, second) = new_member(&set, 0).await;

        set.add_member(first).await.unwrap();
        let err = set.add_member(second.clone()).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateIndex(0)));
        assert!(second.is_broken());
        assert_eq!(set.info().await.state, SetState::Failed);
    }

    #[tokio::test]
    async fn test_live_set_rejects_membership_edits_unless_paused() {
        let set = mirror_set(2);
        let (_, m0) = new_member(&set, 0).await;
        set.add_member(m0).await.unwrap();
        set.start().await.unwrap();
        assert_eq!(set.status(), SetStatus::Degraded);

        let (_, rejected) = new_member(&set, 1).await;
        let err = set.add_member(rejected.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Member(_)));
        assert!(rejected.is_broken());

        let (_, accepted) = new_member(&set, 1).await;
        assert!(set.pause(false).await);
        set.add_member(accepted).await.unwrap();
        set.unpause();
        assert_eq!(set.info().await.active_count, 2);
    }

    #[tokio::test]
    async fn test_underrun_is_forced_to_zero_bytes() {
        let set = concat_set(1, 1024);
        let (device, m0) = new_member(&set, 0).await;
        set.add_member(m0).await.unwrap();
        set.start().await.unwrap();

        device.set_short_read_by(4);
        let err = set.read(0, 16).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Underrun {
                expected: 16,
                transferred: 12
            }
        ));

        device.set_short_read_by(0);
        let data = set.read(0, 16).await.unwrap();
        assert_eq!(data.len(), 16);
    }

    #[tokio::test]
    async fn test_request_over_missing_slot_is_underrun_not_success() {
        init_tracing();
        let set = concat_set(2, 1024);
        let (_, m0) = new_member(&set, 0).await;
        set.add_member(m0).await.unwrap();
        set.start().await.unwrap();

        // the range crosses into the unoccupied second slot; the planned
        // sub-operations all succeed but only cover 124 of 300 bytes
        let err = set.read(900, 300).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Underrun {
                expected: 300,
                transferred: 124
            }
        ));

        let err = set
            .write(900, Bytes::from(vec![7u8; 300]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Underrun { expected: 300, .. }));

        // a range the surviving member fully covers still serves
        let data = set.read(0, 100).await.unwrap();
        assert_eq!(data.len(), 100);
    }

    #[tokio::test]
    async fn test_restart_requires_pause_when_live() {
        let set = mirror_set(1);
        let (_, m0) = new_member(&set, 0).await;
        set.add_member(m0).await.unwrap();
        set.start().await.unwrap();

        // a live restart would rebuild the pool under in-flight requests
        let err = set.start().await.unwrap_err();
        assert!(matches!(err, Error::Member(_)));

        assert!(set.pause(false).await);
        set.start().await.unwrap();
        set.unpause();
        assert_eq!(set.status(), SetStatus::Online);
        set.read(0, 8).await.unwrap();
    }

    #[tokio::test]
    async fn test_one_device_cannot_occupy_two_slots() {
        let set = mirror_set(2);
        let header = set.header().await;
        let device = MemoryMember::with_header(MEMBER_CAPACITY, header.member_header(0));

        let first = Member::new(device.clone(), header.member_header(0));
        set.add_member(first).await.unwrap();

        // same device, different claimed index
        let second = Member::new(device.clone(), header.member_header(1));
        let err = set.add_member(second.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Member(_)));
        assert!(second.is_broken());
        assert_eq!(set.info().await.active_count, 1);
        assert!(set.member_at(1).await.is_none());

        // nor can an active device double as a spare
        let as_spare = Member::new(device, header.member_header(1));
        let err = set.add_spare(as_spare).await.unwrap_err();
        assert!(matches!(err, Error::Member(_)));
        assert_eq!(set.info().await.spare_count, 0);
    }

    #[tokio::test]
    async fn test_failed_set_rejects_new_io() {
        let set = mirror_set(2);
        let (_, m0) = new_member(&set, 0).await;
        let (_, dup) = new_member(&set, 0).await;

        set.add_member(m0).await.unwrap();
        let err = set.add_member(dup).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateIndex(0)));

        // the set still holds a member, but a fatal condition stops
        // new I/O outright
        assert_eq!(set.info().await.active_count, 1);
        let err = set.read(0, 8).await.unwrap_err();
        assert!(matches!(err, Error::SetFailed));
    }

    #[tokio::test]
    async fn test_failed_member_evicted_and_set_degrades() {
        init_tracing();
        let set = mirror_set(2);
        let (bad_device, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;
        set.add_member(m0).await.unwrap();
        set.add_member(m1).await.unwrap();
        set.start().await.unwrap();

        bad_device.set_fail_writes(true);
        let err = set.write(0, Bytes::from_static(b"payload")).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        // recovery evicts the failing member and restarts degraded
        wait_for_active_count(&set, 1).await;
        let info = set.info().await;
        assert_eq!(info.status, SetStatus::Degraded);
        assert_eq!(info.spare_count, 1);
        assert!(!info.paused);

        // the surviving copy keeps serving
        set.write(0, Bytes::from_static(b"payload")).await.unwrap();
        let data = set.read(0, 7).await.unwrap();
        assert_eq!(&data[..], b"payload");
    }

    #[tokio::test]
    async fn test_closing_member_reports_offline_not_hard_error() {
        let set = mirror_set(2);
        let (_, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;
        set.add_member(m0).await.unwrap();
        set.add_member(m1).await.unwrap();
        set.start().await.unwrap();

        // a member drops out between dispatch and completion
        set.member_at(1).await.unwrap().set_state(MemberState::Closing);
        let err = set.read(0, 8).await.unwrap_err();
        assert!(matches!(err, Error::Offline));

        // recovery evicts it to the spare pool and the set degrades
        wait_for_active_count(&set, 1).await;
        let info = set.info().await;
        assert_eq!(info.spare_count, 1);
        assert_eq!(info.status, SetStatus::Degraded);

        let spare = set.member_at(0).await;
        assert!(spare.is_some()); // survivor kept its slot
        set.read(0, 8).await.unwrap();
    }

    struct GateDevice {
        inner: Arc<MemoryMember>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl MemberDevice for GateDevice {
        fn uuid(&self) -> Uuid {
            self.inner.uuid()
        }
        fn capacity(&self) -> u64 {
            self.inner.capacity()
        }
        async fn open(&self) -> Result<RaidHeader> {
            self.inner.open().await
        }
        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
        async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| Error::Io("gate closed".to_string()))?;
            permit.forget();
            self.inner.read_at(offset, length).await
        }
        async fn write_at(&self, offset: u64, data: Bytes) -> Result<u64> {
            self.inner.write_at(offset, data).await
        }
        async fn flush(&self) -> Result<()> {
            self.inner.flush().await
        }
        async fn write_header(&self, header: &RaidHeader) -> Result<()> {
            self.inner.write_header(header).await
        }
    }

    #[tokio::test]
    async fn test_pool_backpressure_blocks_extra_allocator() {
        let mut config = SetConfig::new("tight", 1);
        config.request_pool_capacity = 1;
        let set = RaidSet::new(
            config,
            Arc::new(ConcatPolicy::new(MEMBER_CAPACITY as u64)),
            Arc::new(NullRegistry),
        )
        .unwrap();

        let header = set.header().await.member_header(0);
        let gate = Arc::new(Semaphore::new(0));
        let device = Arc::new(GateDevice {
            inner: MemoryMember::with_header(MEMBER_CAPACITY, header.clone()),
            gate: gate.clone(),
        });
        set.add_member(Member::new(device, header)).await.unwrap();
        set.start().await.unwrap();

        let first = {
            let set = set.clone();
            tokio::spawn(async move { set.read(0, 8).await })
        };
        sleep(Duration::from_millis(30)).await;
        let second = {
            let set = set.clone();
            tokio::spawn(async move { set.read(64, 8).await })
        };
        sleep(Duration::from_millis(30)).await;

        // the single record is checked out; the second caller is parked
        // in allocation, not failed and not dispatched
        assert!(!first.is_finished());
        assert!(!second.is_finished());
        assert_eq!(set.info().await.pending_requests, 1);

        gate.add_permits(2);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(set.info().await.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_pause_when_idle_refuses_with_pending_io() {
        let set = mirror_set(1);
        let header = set.header().await.member_header(0);
        let gate = Arc::new(Semaphore::new(0));
        let device = Arc::new(GateDevice {
            inner: MemoryMember::with_header(MEMBER_CAPACITY, header.clone()),
            gate: gate.clone(),
        });
        set.add_member(Member::new(device, header)).await.unwrap();
        set.start().await.unwrap();

        let inflight = {
            let set = set.clone();
            tokio::spawn(async move { set.read(0, 8).await })
        };
        sleep(Duration::from_millis(30)).await;

        assert!(!set.pause(true).await);

        gate.add_permits(1);
        inflight.await.unwrap().unwrap();

        assert!(set.pause(true).await);
        set.unpause();
    }

    #[tokio::test]
    async fn test_paused_set_blocks_new_io_until_unpause() {
        let set = mirror_set(1);
        let (_, m0) = new_member(&set, 0).await;
        set.add_member(m0).await.unwrap();
        set.start().await.unwrap();

        assert!(set.pause(false).await);
        let blocked = {
            let set = set.clone();
            tokio::spawn(async move { set.read(0, 8).await })
        };
        sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());

        set.unpause();
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_aggregation_first_error_wins() {
        let set = mirror_set(2);
        let (_, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;
        set.add_member(m0).await.unwrap();
        set.add_member(m1).await.unwrap();
        set.start().await.unwrap();

        let mut request = set.pool.try_take().unwrap();
        let (tx, rx) = oneshot::channel();
        request.prepare(0, 8, IoDirection::Write, 2, tx);
        request.expected_bytes = 16;
        request.plan = vec![
            SubOp { slot: 0, member_offset: 0, buf_offset: 0, length: 8 },
            SubOp { slot: 1, member_offset: 0, buf_offset: 0, length: 8 },
        ];
        request.record(0, MemberOutcome::Failed(Error::Io("boom".to_string())), 0, None);
        request.record(1, MemberOutcome::Success, 8, None);
        set.complete_request(request).await;

        let completion = rx.await.unwrap();
        // the recorded member error is reported, not an underrun derived
        // from the bytes that stopped counting
        assert!(matches!(completion.status, Err(Error::Io(_))));
        assert_eq!(completion.bytes, 0);
    }

    #[tokio::test]
    async fn test_aggregation_is_deterministic_for_fixed_vectors() {
        let set = mirror_set(2);
        let (_, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;
        set.add_member(m0).await.unwrap();
        set.add_member(m1).await.unwrap();
        set.start().await.unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let mut request = set.pool.try_take().unwrap();
            let (tx, rx) = oneshot::channel();
            request.prepare(0, 16, IoDirection::Write, 2, tx);
            request.expected_bytes = 32;
            request.plan = vec![
                SubOp { slot: 0, member_offset: 0, buf_offset: 0, length: 16 },
                SubOp { slot: 1, member_offset: 0, buf_offset: 0, length: 16 },
            ];
            request.record(0, MemberOutcome::Success, 16, None);
            request.record(1, MemberOutcome::Success, 16, None);
            set.complete_request(request).await;
            let completion = rx.await.unwrap();
            outcomes.push((completion.status.is_ok(), completion.bytes));
        }
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(outcomes[0], (true, 16));
    }

    #[tokio::test]
    async fn test_destroyed_set_fails_io_fast() {
        let set = mirror_set(2);
        let (_, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;
        set.add_member(m0).await.unwrap();
        set.add_member(m1).await.unwrap();
        set.start().await.unwrap();

        set.destroy().await.unwrap();
        assert_eq!(set.status(), SetStatus::Offline);
        assert_eq!(set.info().await.active_count, 0);

        let err = set.read(0, 8).await.unwrap_err();
        assert!(matches!(err, Error::NoMedium));
    }

    #[tokio::test]
    async fn test_empty_started_set_terminates() {
        let set = mirror_set(1);
        set.start().await.unwrap();

        assert_eq!(set.info().await.state, SetState::Terminating);
        let err = set.read(0, 8).await.unwrap_err();
        assert!(matches!(err, Error::NoMedium));
    }

    #[tokio::test]
    async fn test_reconfigure_grows_membership() {
        let set = mirror_set(2);
        let (_, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;
        set.add_member(m0).await.unwrap();
        set.add_member(m1).await.unwrap();
        set.start().await.unwrap();
        assert_eq!(set.info().await.sequence_number, 1);

        let (_, m2) = new_member(&set, 2).await;
        set.reconfigure(SetUpdate {
            member_count: Some(3),
            add_members: vec![m2],
            ..Default::default()
        })
        .await
        .unwrap();

        let info = set.info().await;
        assert_eq!(info.member_count, 3);
        assert_eq!(info.active_count, 3);
        assert_eq!(info.status, SetStatus::Online);
        // healthy full-membership restart bumps the generation
        assert_eq!(info.sequence_number, 2);
        assert!(!info.paused);
    }

    struct RecordingRegistry {
        events: parking_lot::Mutex<Vec<String>>,
    }

    impl DeviceRegistry for RecordingRegistry {
        fn publish(&self, name: &str, _uuid: Uuid, _capacity: u64) {
            self.events.lock().push(format!("publish {}", name));
        }
        fn unpublish(&self, _uuid: Uuid) {
            self.events.lock().push("unpublish".to_string());
        }
    }

    #[tokio::test]
    async fn test_registry_sees_publish_and_unpublish() {
        let registry = Arc::new(RecordingRegistry {
            events: parking_lot::Mutex::new(Vec::new()),
        });
        let set = RaidSet::new(
            SetConfig::new("pub", 1),
            Arc::new(MirrorPolicy::new()),
            registry.clone(),
        )
        .unwrap();
        let (_, m0) = new_member(&set, 0).await;
        set.add_member(m0).await.unwrap();

        set.start().await.unwrap();
        assert_eq!(registry.events.lock().as_slice(), ["publish pub"]);

        set.destroy().await.unwrap();
        assert_eq!(
            registry.events.lock().as_slice(),
            ["publish pub", "unpublish"]
        );
    }

    #[tokio::test]
    async fn test_status_observers_are_notified() {
        let set = mirror_set(1);
        let mut status = set.watch_status();
        assert_eq!(*status.borrow(), SetStatus::Offline);

        let (_, m0) = new_member(&set, 0).await;
        set.add_member(m0).await.unwrap();
        set.start().await.unwrap();

        timeout(Duration::from_secs(1), status.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*status.borrow(), SetStatus::Online);
    }

    #[tokio::test]
    async fn test_cache_sync_reaches_stacked_members() {
        // inner mirror of two RAM devices
        let inner = mirror_set(2);
        let (leaf0, m0) = new_member(&inner, 0).await;
        let (leaf1, m1) = new_member(&inner, 1).await;
        inner.add_member(m0).await.unwrap();
        inner.add_member(m1).await.unwrap();
        inner.start().await.unwrap();

        // outer concatenation with the inner set as its only member
        let outer = concat_set(1, MEMBER_CAPACITY as u64);
        let header = outer.header().await.member_header(0);
        MemberDevice::write_header(inner.as_ref(), &header)
            .await
            .unwrap();
        let stacked: Arc<dyn MemberDevice> = inner.clone();
        outer.add_member(Member::new(stacked, header)).await.unwrap();
        outer.start().await.unwrap();
        assert_eq!(outer.status(), SetStatus::Online);

        // I/O tunnels through the stack
        outer.write(0, Bytes::from_static(b"stacked")).await.unwrap();
        let data = outer.read(0, 7).await.unwrap();
        assert_eq!(&data[..], b"stacked");

        // the barrier fans out through the nested set to the leaves
        outer.synchronize_cache().await.unwrap();
        assert_eq!(leaf0.flush_count(), 1);
        assert_eq!(leaf1.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_cache_sync_reports_first_failure() {
        let set = mirror_set(2);
        let (bad, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;
        set.add_member(m0).await.unwrap();
        set.add_member(m1).await.unwrap();
        set.start().await.unwrap();

        bad.set_fail_flush(true);
        let err = set.synchronize_cache().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_resize_demotes_displaced_members_to_spares() {
        let set = mirror_set(3);
        let (_, m0) = new_member(&set, 0).await;
        let (_, m1) = new_member(&set, 1).await;
        let (_, m2) = new_member(&set, 2).await;
        set.add_member(m0).await.unwrap();
        set.add_member(m1).await.unwrap();
        set.add_member(m2).await.unwrap();

        set.resize(2).await.unwrap();
        let info = set.info().await;
        assert_eq!(info.member_count, 2);
        assert_eq!(info.active_count, 2);
        assert_eq!(info.spare_count, 1);
    }
}
