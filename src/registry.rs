//! Device registry hooks
//!
//! When a set reaches the operational tier it is published to the OS device
//! registry; when it leaves, it is unpublished. The registry itself is an
//! external collaborator, so the core only calls these idempotent hooks.

use uuid::Uuid;

/// Registry a set publishes itself to when it comes online
///
/// Both hooks must be idempotent; the set may call them repeatedly across
/// Online/Degraded transitions.
pub trait DeviceRegistry: Send + Sync {
    /// Announce an operational volume
    fn publish(&self, name: &str, uuid: Uuid, capacity: u64);

    /// Withdraw a volume
    fn unpublish(&self, uuid: Uuid);
}

/// Registry that ignores all announcements
pub struct NullRegistry;

impl DeviceRegistry for NullRegistry {
    fn publish(&self, _name: &str, _uuid: Uuid, _capacity: u64) {}

    fn unpublish(&self, _uuid: Uuid) {}
}
