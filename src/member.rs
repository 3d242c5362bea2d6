//! Members of a RAID set
//!
//! A member is one underlying storage volume participating in a set. The
//! set owns the attachment relationship: an attached member sits either in
//! a table slot or in the spare pool, never both. The storage itself is
//! reached through the [`MemberDevice`] trait so that plain devices,
//! in-memory volumes, and nested sets all look the same to the core.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::header::RaidHeader;

/// Lifecycle state of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Attached but not opened for I/O
    Closed,
    /// Open and serving I/O
    Open,
    /// Dropping out of the set; close pending
    Closing,
    /// Unusable until an administrator intervenes
    Broken,
    /// Attached but inactive, awaiting promotion
    Spare,
    /// Being resynchronized from the rest of the set
    Rebuilding,
}

/// Backing storage for one member
///
/// Implementations must be safe to call from multiple tasks; the set only
/// serializes membership changes, not data-path I/O.
#[async_trait]
pub trait MemberDevice: Send + Sync {
    /// Stable identity of this device
    fn uuid(&self) -> Uuid;

    /// Usable capacity in bytes
    fn capacity(&self) -> u64;

    /// Open the device and read its header copy
    async fn open(&self) -> Result<RaidHeader>;

    /// Close the device
    async fn close(&self) -> Result<()>;

    /// Read `length` bytes starting at `offset`
    ///
    /// A short read is not an error at this level; the set-level
    /// aggregation turns short transfers into an underrun.
    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes>;

    /// Write `data` starting at `offset`, returning the bytes written
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<u64>;

    /// Flush any cached writes to stable storage
    async fn flush(&self) -> Result<()>;

    /// Persist an updated header copy
    async fn write_header(&self, header: &RaidHeader) -> Result<()>;
}

/// A member as tracked by the set: device handle, header copy, and state
pub struct Member {
    device: Arc<dyn MemberDevice>,
    header: RwLock<RaidHeader>,
    state: RwLock<MemberState>,
}

impl Member {
    /// Wrap a device and its header copy as an attachable member
    ///
    /// Members start out Closed; the set opens them when it starts.
    pub fn new(device: Arc<dyn MemberDevice>, header: RaidHeader) -> Arc<Self> {
        Arc::new(Member {
            device,
            header: RwLock::new(header),
            state: RwLock::new(MemberState::Closed),
        })
    }

    /// Identity of the underlying device
    pub fn uuid(&self) -> Uuid {
        self.device.uuid()
    }

    /// The underlying device
    pub fn device(&self) -> &Arc<dyn MemberDevice> {
        &self.device
    }

    /// Current lifecycle state
    pub fn state(&self) -> MemberState {
        *self.state.read()
    }

    /// Move the member to a new lifecycle state
    pub fn set_state(&self, state: MemberState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(member = %self.uuid(), from = ?*current, to = ?state, "member state change");
            *current = state;
        }
    }

    /// Logical index declared in this member's header copy
    pub fn member_index(&self) -> u32 {
        self.header.read().member_index
    }

    /// Header generation this member carries
    pub fn sequence_number(&self) -> u64 {
        self.header.read().sequence_number
    }

    /// Header format version this member carries
    pub fn header_version(&self) -> u32 {
        self.header.read().header_version
    }

    /// Snapshot of this member's header copy
    pub fn header(&self) -> RaidHeader {
        self.header.read().clone()
    }

    /// Replace this member's header copy
    pub fn update_header(&self, header: RaidHeader) {
        *self.header.write() = header;
    }

    /// Whether the member is unusable
    pub fn is_broken(&self) -> bool {
        self.state() == MemberState::Broken
    }
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("uuid", &self.uuid())
            .field("index", &self.member_index())
            .field("state", &self.state())
            .finish()
    }
}

/// RAM-backed member device with failure injection
///
/// Used by tests and by demos that stack sets without real media.
pub struct MemoryMember {
    uuid: Uuid,
    data: Mutex<Vec<u8>>,
    header: Mutex<Option<RaidHeader>>,
    flush_count: AtomicUsize,
    fail_open: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_flush: AtomicBool,
    short_read_by: AtomicUsize,
}

impl MemoryMember {
    /// Create a zero-filled device of the given capacity
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(MemoryMember {
            uuid: Uuid::new_v4(),
            data: Mutex::new(vec![0u8; capacity]),
            header: Mutex::new(None),
            flush_count: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_flush: AtomicBool::new(false),
            short_read_by: AtomicUsize::new(0),
        })
    }

    /// Create a device that already carries a header copy
    pub fn with_header(capacity: usize, header: RaidHeader) -> Arc<Self> {
        let device = MemoryMember::new(capacity);
        *device.header.lock() = Some(header);
        device
    }

    /// Make subsequent opens fail
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent reads fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent flushes fail
    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::Relaxed);
    }

    /// Cut this many bytes off the end of every read
    pub fn set_short_read_by(&self, bytes: usize) {
        self.short_read_by.store(bytes, Ordering::Relaxed);
    }

    /// Number of flushes this device has seen
    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MemberDevice for MemoryMember {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn capacity(&self) -> u64 {
        self.data.lock().len() as u64
    }

    async fn open(&self) -> Result<RaidHeader> {
        if self.fail_open.load(Ordering::Relaxed) {
            return Err(Error::Io("injected open failure".to_string()));
        }
        self.header
            .lock()
            .clone()
            .ok_or_else(|| Error::Io("device has no header".to_string()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(Error::Io("injected read failure".to_string()));
        }
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let mut end = (start + length).min(data.len());
        let cut = self.short_read_by.load(Ordering::Relaxed);
        end = end.saturating_sub(cut).max(start);
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> Result<u64> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::Io("injected write failure".to_string()));
        }
        let mut backing = self.data.lock();
        let start = (offset as usize).min(backing.len());
        let writable = (backing.len() - start).min(data.len());
        backing[start..start + writable].copy_from_slice(&data[..writable]);
        Ok(writable as u64)
    }

    async fn flush(&self) -> Result<()> {
        if self.fail_flush.load(Ordering::Relaxed) {
            return Err(Error::Io("injected flush failure".to_string()));
        }
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn write_header(&self, header: &RaidHeader) -> Result<()> {
        *self.header.lock() = Some(header.clone());
        Ok(())
    }
}
