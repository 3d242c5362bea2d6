//! Set manager: the owning controller for every assembled set
//!
//! Maps set identities to their authoritative instances. Recovery consults
//! this mapping to detect that a concurrent destroy or replace won the
//! race before it touches membership.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::SetConfig;
use crate::error::{Error, Result};
use crate::policy::LevelPolicy;
use crate::registry::DeviceRegistry;
use crate::set::RaidSet;

/// Owns and tracks every assembled RAID set
pub struct SetManager {
    sets: RwLock<HashMap<Uuid, Arc<RaidSet>>>,
}

impl SetManager {
    /// Create an empty manager
    pub fn new() -> Arc<Self> {
        Arc::new(SetManager {
            sets: RwLock::new(HashMap::new()),
        })
    }

    /// Create a set and register it as authoritative for its identity
    pub fn create_set(
        self: &Arc<Self>,
        config: SetConfig,
        policy: Arc<dyn LevelPolicy>,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Result<Arc<RaidSet>> {
        let set = RaidSet::new(config, policy, registry)?;
        set.attach_manager(Arc::downgrade(self));
        self.sets.write().insert(set.uuid(), set.clone());
        info!(set = %set.name(), uuid = %set.uuid(), "set registered");
        Ok(set)
    }

    /// The authoritative set for an identity, if any
    pub fn lookup(&self, uuid: Uuid) -> Option<Arc<RaidSet>> {
        self.sets.read().get(&uuid).cloned()
    }

    /// All registered sets
    pub fn sets(&self) -> Vec<Arc<RaidSet>> {
        self.sets.read().values().cloned().collect()
    }

    /// Whether this exact instance still answers for its identity
    pub(crate) fn is_authoritative(&self, set: &Arc<RaidSet>) -> bool {
        self.lookup(set.uuid())
            .map(|current| Arc::ptr_eq(&current, set))
            .unwrap_or(false)
    }

    /// Drop the mapping for an identity
    pub(crate) fn forget(&self, uuid: Uuid) {
        self.sets.write().remove(&uuid);
    }

    /// Destroy a set and drop its registration
    pub async fn destroy_set(&self, uuid: Uuid) -> Result<()> {
        let set = self.lookup(uuid).ok_or(Error::UnknownSet(uuid))?;
        set.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MirrorPolicy;
    use crate::registry::NullRegistry;

    fn manager_with_set() -> (Arc<SetManager>, Arc<RaidSet>) {
        let manager = SetManager::new();
        let set = manager
            .create_set(
                SetConfig::new("vol0", 2),
                Arc::new(MirrorPolicy::new()),
                Arc::new(NullRegistry),
            )
            .unwrap();
        (manager, set)
    }

    #[test]
    fn test_lookup_returns_registered_set() {
        let (manager, set) = manager_with_set();
        let found = manager.lookup(set.uuid()).unwrap();
        assert!(Arc::ptr_eq(&found, &set));
        assert!(manager.is_authoritative(&set));
        assert_eq!(manager.sets().len(), 1);
    }

    #[test]
    fn test_replaced_set_is_not_authoritative() {
        let (manager, set) = manager_with_set();

        // a replacement instance takes over the identity
        manager.forget(set.uuid());
        assert!(!manager.is_authoritative(&set));
    }

    #[tokio::test]
    async fn test_destroy_set_unregisters() {
        let (manager, set) = manager_with_set();

        manager.destroy_set(set.uuid()).await.unwrap();
        assert!(manager.lookup(set.uuid()).is_none());

        let err = manager.destroy_set(set.uuid()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownSet(_)));
    }
}
