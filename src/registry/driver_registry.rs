//! Driver Registry
//!
//! A name-keyed store of capability implementations. One registry instance
//! exists per driver category; lookups hand back the stored `Arc` so every
//! caller shares the same driver object.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Driver Category
// =============================================================================

/// Capability category a registry serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverCategory {
    /// Node lifecycle control (ssh, cloud instance APIs)
    NodeControl,
    /// Workload scheduling
    Scheduler,
    /// Storage / volume management
    Storage,
    /// Backup management
    Backup,
    /// Application chart definitions
    Application,
}

impl std::fmt::Display for DriverCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverCategory::NodeControl => write!(f, "node"),
            DriverCategory::Scheduler => write!(f, "scheduler"),
            DriverCategory::Storage => write!(f, "storage"),
            DriverCategory::Backup => write!(f, "backup"),
            DriverCategory::Application => write!(f, "application"),
        }
    }
}

// =============================================================================
// Registration Policy
// =============================================================================

/// Whether an existing entry may be overwritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegistrationPolicy {
    /// `register` only; duplicates are rejected and `replace` is refused
    #[default]
    InsertOnly,
    /// `replace` may overwrite entries (used when definitions are rescanned)
    InsertOrReplace,
}

// =============================================================================
// Driver Registry
// =============================================================================

/// Registry mapping driver names to implementations of one capability
pub struct DriverRegistry<D: ?Sized> {
    category: DriverCategory,
    policy: RegistrationPolicy,
    /// Entries in registration order
    entries: RwLock<IndexMap<String, Arc<D>>>,
}

impl<D: ?Sized> std::fmt::Debug for DriverRegistry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("category", &self.category)
            .field("policy", &self.policy)
            .field("names", &self.entries.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<D: ?Sized> DriverRegistry<D> {
    /// Create an insert-only registry
    pub fn new(category: DriverCategory) -> Self {
        Self::with_policy(category, RegistrationPolicy::InsertOnly)
    }

    /// Create a registry whose entries may be replaced on rescan
    pub fn replaceable(category: DriverCategory) -> Self {
        Self::with_policy(category, RegistrationPolicy::InsertOrReplace)
    }

    pub fn with_policy(category: DriverCategory, policy: RegistrationPolicy) -> Self {
        Self {
            category,
            policy,
            entries: RwLock::new(IndexMap::new()),
        }
    }

    pub fn category(&self) -> DriverCategory {
        self.category
    }

    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    /// Register a driver under `name`.
    ///
    /// Fails with [`Error::DriverAlreadyRegistered`] if the name is taken,
    /// regardless of the registry policy. The existing entry is left intact.
    pub fn register(&self, name: impl Into<String>, driver: Arc<D>) -> Result<()> {
        let name = name.into();
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(Error::DriverAlreadyRegistered {
                category: self.category,
                name,
            });
        }
        entries.insert(name, driver);
        Ok(())
    }

    /// Insert or overwrite the driver under `name`, returning the previous one.
    ///
    /// Only available on registries created with
    /// [`RegistrationPolicy::InsertOrReplace`].
    pub fn replace(&self, name: impl Into<String>, driver: Arc<D>) -> Result<Option<Arc<D>>> {
        let name = name.into();
        if self.policy != RegistrationPolicy::InsertOrReplace {
            return Err(Error::ReplaceNotAllowed {
                category: self.category,
                name,
            });
        }
        Ok(self.entries.write().insert(name, driver))
    }

    /// Look up a driver by name
    pub fn get(&self, name: &str) -> Result<Arc<D>> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DriverNotFound {
                id: name.to_string(),
                category: self.category,
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// All registered drivers, in registration order
    pub fn get_all(&self) -> Vec<Arc<D>> {
        self.entries.read().values().cloned().collect()
    }

    /// Registered drivers accepted by `filter`, in registration order
    pub fn get_all_matching(&self, filter: impl Fn(&D) -> bool) -> Vec<Arc<D>> {
        self.entries
            .read()
            .values()
            .filter(|d| filter(d))
            .cloned()
            .collect()
    }

    /// Registered names, in registration order
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
