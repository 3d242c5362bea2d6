//! Reusable in-flight request records
//!
//! Requests are never constructed ad hoc: the pool owns a fixed number of
//! records, hands them out to the set's I/O entry points, and takes them
//! back when the completion aggregator is done. A checked-out record is
//! exclusively owned by its request until returned. When the pool runs dry
//! the allocator blocks on the availability condition until a record comes
//! back.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::policy::SubOp;

/// Direction of a storage request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Outcome of one member's sub-operation
#[derive(Debug)]
pub enum MemberOutcome {
    /// Slot did not participate
    Skipped,
    /// Sub-operation completed without error
    Success,
    /// Sub-operation failed
    Failed(Error),
}

/// Final aggregated result delivered to the caller, exactly once
#[derive(Debug)]
pub struct IoCompletion {
    /// Aggregate status of the request
    pub status: Result<()>,
    /// Bytes transferred from the caller's point of view; zero on error
    pub bytes: u64,
    /// Assembled payload for successful reads
    pub data: Option<Bytes>,
}

/// One in-flight request record
pub struct StorageRequest {
    /// Start of the target byte range
    pub(crate) offset: u64,
    /// Length of the target byte range
    pub(crate) length: usize,
    /// Read or write
    pub(crate) direction: IoDirection,
    /// Sum of planned sub-operation lengths; the underrun reference
    pub(crate) expected_bytes: u64,
    /// Planned sub-operations, at most one per slot
    pub(crate) plan: Vec<SubOp>,
    /// Per-member status vector, indexed by slot
    pub(crate) member_status: Vec<MemberOutcome>,
    /// Per-member byte counts, indexed by slot
    pub(crate) member_bytes: Vec<u64>,
    /// Per-member read payloads, indexed by slot
    pub(crate) member_data: Vec<Option<Bytes>>,
    /// Caller's completion, consumed on aggregation
    pub(crate) completion: Option<oneshot::Sender<IoCompletion>>,
}

impl StorageRequest {
    fn new(width: usize) -> Self {
        let mut request = StorageRequest {
            offset: 0,
            length: 0,
            direction: IoDirection::Read,
            expected_bytes: 0,
            plan: Vec::new(),
            member_status: Vec::new(),
            member_bytes: Vec::new(),
            member_data: Vec::new(),
            completion: None,
        };
        request.resize_vectors(width);
        request
    }

    fn resize_vectors(&mut self, width: usize) {
        self.member_status.clear();
        self.member_status.resize_with(width, || MemberOutcome::Skipped);
        self.member_bytes.clear();
        self.member_bytes.resize(width, 0);
        self.member_data.clear();
        self.member_data.resize_with(width, || None);
    }

    /// Bind a caller's byte range and completion to this record
    pub(crate) fn prepare(
        &mut self,
        offset: u64,
        length: usize,
        direction: IoDirection,
        width: usize,
        completion: oneshot::Sender<IoCompletion>,
    ) {
        self.offset = offset;
        self.length = length;
        self.direction = direction;
        self.expected_bytes = 0;
        self.plan.clear();
        self.resize_vectors(width);
        self.completion = Some(completion);
    }

    /// Record one member's outcome
    pub(crate) fn record(
        &mut self,
        slot: usize,
        outcome: MemberOutcome,
        bytes: u64,
        data: Option<Bytes>,
    ) {
        if slot < self.member_status.len() {
            self.member_status[slot] = outcome;
            self.member_bytes[slot] = bytes;
            self.member_data[slot] = data;
        }
    }

    /// Clear transient per-request state before the record is pooled again
    pub(crate) fn reset(&mut self) {
        self.plan.clear();
        self.expected_bytes = 0;
        self.completion = None;
        for status in &mut self.member_status {
            *status = MemberOutcome::Skipped;
        }
        for bytes in &mut self.member_bytes {
            *bytes = 0;
        }
        for data in &mut self.member_data {
            *data = None;
        }
    }
}

/// Bounded pool of reusable request records
pub struct RequestPool {
    free: Mutex<Vec<Box<StorageRequest>>>,
    capacity: usize,
    available: Notify,
}

impl RequestPool {
    /// Create a pool of `capacity` records sized for `width` member slots
    pub fn new(capacity: usize, width: usize) -> Self {
        let free = (0..capacity)
            .map(|_| Box::new(StorageRequest::new(width)))
            .collect();
        RequestPool {
            free: Mutex::new(free),
            capacity,
            available: Notify::new(),
        }
    }

    /// Pool capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records currently available
    pub fn available_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Drain and rebuild every record for a new member width
    ///
    /// Callers must have quiesced the set first; a rebuild with requests
    /// still checked out would discard their records.
    pub fn rebuild(&self, width: usize) {
        let mut free = self.free.lock();
        debug_assert_eq!(free.len(), self.capacity, "pool rebuilt while requests in flight");
        free.clear();
        free.extend((0..self.capacity).map(|_| Box::new(StorageRequest::new(width))));
    }

    /// Take a record if one is free
    pub fn try_take(&self) -> Option<Box<StorageRequest>> {
        self.free.lock().pop()
    }

    /// Return a record and wake one blocked allocator
    pub fn put_back(&self, mut request: Box<StorageRequest>) {
        request.reset();
        self.free.lock().push(request);
        self.available.notify_one();
    }

    /// Future resolving when a record may have become available
    ///
    /// Register the future before releasing the set lock so a concurrent
    /// `put_back` cannot slip between the failed take and the wait.
    pub fn notified(&self) -> Notified<'_> {
        self.available.notified()
    }
}
