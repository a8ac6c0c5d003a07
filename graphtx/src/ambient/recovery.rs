// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Recovery descriptors and their stores
//!
//! A descriptor holds everything needed to rebuild an equivalent HTTP
//! transaction handle and finish the two-phase protocol for it, without the
//! code that enlisted it. Descriptors are keyed by resource manager id and
//! unit of work id.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use super::Outcome;
use crate::config::{ExecutionConfiguration, TransportKind};
use crate::error::{Result, TransactionError};
use crate::txn::handle::TransactionHandle;
use crate::txn::http::{HttpTransaction, HttpTransport};
use crate::version::ServerVersion;

/// Serializable state needed to complete an enlisted transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryDescriptor {
    pub resource_manager_id: Uuid,
    pub unit_of_work_id: Uuid,
    pub configuration: ExecutionConfiguration,
    pub transport: TransportKind,
    pub server_version: ServerVersion,
    pub database: String,
    /// Transaction resource URI, once the transaction began
    pub location: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Where descriptors live between enlistment and completion
pub trait RecoveryStore: Send + Sync {
    fn save(&self, descriptor: &RecoveryDescriptor) -> Result<()>;

    fn load(
        &self,
        resource_manager_id: Uuid,
        unit_of_work_id: Uuid,
    ) -> Result<Option<RecoveryDescriptor>>;

    /// All outstanding descriptors of one resource manager
    fn list(&self, resource_manager_id: Uuid) -> Result<Vec<RecoveryDescriptor>>;

    fn remove(&self, resource_manager_id: Uuid, unit_of_work_id: Uuid) -> Result<bool>;
}

/// Process-local store
#[derive(Default)]
pub struct InMemoryRecoveryStore {
    entries: RwLock<HashMap<Uuid, HashMap<Uuid, RecoveryDescriptor>>>,
}

impl InMemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecoveryStore for InMemoryRecoveryStore {
    fn save(&self, descriptor: &RecoveryDescriptor) -> Result<()> {
        self.entries
            .write()
            .entry(descriptor.resource_manager_id)
            .or_default()
            .insert(descriptor.unit_of_work_id, descriptor.clone());
        Ok(())
    }

    fn load(
        &self,
        resource_manager_id: Uuid,
        unit_of_work_id: Uuid,
    ) -> Result<Option<RecoveryDescriptor>> {
        Ok(self
            .entries
            .read()
            .get(&resource_manager_id)
            .and_then(|by_uow| by_uow.get(&unit_of_work_id))
            .cloned())
    }

    fn list(&self, resource_manager_id: Uuid) -> Result<Vec<RecoveryDescriptor>> {
        Ok(self
            .entries
            .read()
            .get(&resource_manager_id)
            .map(|by_uow| by_uow.values().cloned().collect())
            .unwrap_or_default())
    }

    fn remove(&self, resource_manager_id: Uuid, unit_of_work_id: Uuid) -> Result<bool> {
        let mut entries = self.entries.write();
        let Some(by_uow) = entries.get_mut(&resource_manager_id) else {
            return Ok(false);
        };
        let removed = by_uow.remove(&unit_of_work_id).is_some();
        if by_uow.is_empty() {
            entries.remove(&resource_manager_id);
        }
        Ok(removed)
    }
}

lazy_static! {
    /// Process-wide descriptor store used when a manager is not given one
    static ref GLOBAL_RECOVERY_STORE: Arc<InMemoryRecoveryStore> =
        Arc::new(InMemoryRecoveryStore::new());
}

pub fn global_recovery_store() -> Arc<dyn RecoveryStore> {
    GLOBAL_RECOVERY_STORE.clone()
}

/// One JSON file per descriptor: `{dir}/{resource manager}/{unit of work}.json`
pub struct JsonFileRecoveryStore {
    dir: PathBuf,
}

impl JsonFileRecoveryStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn manager_dir(&self, resource_manager_id: Uuid) -> PathBuf {
        self.dir.join(resource_manager_id.to_string())
    }

    fn path(&self, resource_manager_id: Uuid, unit_of_work_id: Uuid) -> PathBuf {
        self.manager_dir(resource_manager_id)
            .join(format!("{}.json", unit_of_work_id))
    }
}

impl RecoveryStore for JsonFileRecoveryStore {
    fn save(&self, descriptor: &RecoveryDescriptor) -> Result<()> {
        let dir = self.manager_dir(descriptor.resource_manager_id);
        fs::create_dir_all(&dir)?;

        let path = self.path(descriptor.resource_manager_id, descriptor.unit_of_work_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(descriptor)?)?;
        fs::rename(&tmp, &path)?;
        debug!("Recovery descriptor written to {}", path.display());
        Ok(())
    }

    fn load(
        &self,
        resource_manager_id: Uuid,
        unit_of_work_id: Uuid,
    ) -> Result<Option<RecoveryDescriptor>> {
        let path = self.path(resource_manager_id, unit_of_work_id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, resource_manager_id: Uuid) -> Result<Vec<RecoveryDescriptor>> {
        let dir = self.manager_dir(resource_manager_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut descriptors = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            descriptors.push(serde_json::from_slice(&bytes)?);
        }
        Ok(descriptors)
    }

    fn remove(&self, resource_manager_id: Uuid, unit_of_work_id: Uuid) -> Result<bool> {
        match fs::remove_file(self.path(resource_manager_id, unit_of_work_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Rebuild the transaction a descriptor points at and apply `outcome`
pub async fn recover(
    descriptor: &RecoveryDescriptor,
    transport: Arc<dyn HttpTransport>,
    outcome: Outcome,
) -> Result<()> {
    if descriptor.transport != TransportKind::Http {
        return Err(TransactionError::unsupported(
            "driver session transactions cannot be recovered outside their session",
        ));
    }
    let Some(location) = descriptor.location.clone() else {
        debug!(
            "Unit of work {} never reached the server; nothing to recover",
            descriptor.unit_of_work_id
        );
        return Ok(());
    };

    let handle = TransactionHandle::Http(HttpTransaction::attach(
        transport,
        Arc::new(descriptor.configuration.clone()),
        descriptor.server_version,
        descriptor.database.clone(),
        location,
    ));

    info!(
        "Recovering unit of work {} for resource manager {}: {:?}",
        descriptor.unit_of_work_id, descriptor.resource_manager_id, outcome
    );
    match outcome {
        Outcome::Committed => handle.commit().await,
        Outcome::RolledBack => handle.rollback().await,
    }
}

/// Recover every outstanding descriptor of a resource manager.
///
/// Descriptors are removed once recovered; the first failure stops the pass
/// and leaves the failing descriptor in place.
pub async fn recover_all<F>(
    store: &dyn RecoveryStore,
    resource_manager_id: Uuid,
    transport: Arc<dyn HttpTransport>,
    decide: F,
) -> Result<usize>
where
    F: Fn(&RecoveryDescriptor) -> Outcome,
{
    let descriptors = store.list(resource_manager_id)?;
    let mut recovered = 0;

    for descriptor in descriptors {
        let outcome = decide(&descriptor);
        if let Err(e) = recover(&descriptor, Arc::clone(&transport), outcome).await {
            warn!(
                "Recovery of unit of work {} failed: {}",
                descriptor.unit_of_work_id, e
            );
            return Err(e);
        }
        store.remove(resource_manager_id, descriptor.unit_of_work_id)?;
        recovered += 1;
    }

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(rm: Uuid) -> RecoveryDescriptor {
        RecoveryDescriptor {
            resource_manager_id: rm,
            unit_of_work_id: Uuid::new_v4(),
            configuration: ExecutionConfiguration::new("http://localhost:7474"),
            transport: TransportKind::Http,
            server_version: ServerVersion::new(4, 4, 0),
            database: "neo4j".to_string(),
            location: Some("http://localhost:7474/db/neo4j/tx/3".to_string()),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryRecoveryStore::new();
        let rm = Uuid::new_v4();
        let first = descriptor(rm);
        let second = descriptor(rm);

        store.save(&first).unwrap();
        store.save(&second).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.list(rm).unwrap().len(), 2);
        assert_eq!(
            store.load(rm, first.unit_of_work_id).unwrap(),
            Some(first.clone())
        );

        assert!(store.remove(rm, first.unit_of_work_id).unwrap());
        assert!(!store.remove(rm, first.unit_of_work_id).unwrap());
        assert!(store.remove(rm, second.unit_of_work_id).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_json_file_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileRecoveryStore::open(temp_dir.path()).unwrap();
        let rm = Uuid::new_v4();
        let saved = descriptor(rm);

        assert!(store.list(rm).unwrap().is_empty());
        store.save(&saved).unwrap();

        // A second store over the same directory sees the descriptor
        let reopened = JsonFileRecoveryStore::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.load(rm, saved.unit_of_work_id).unwrap(), Some(saved.clone()));
        assert_eq!(reopened.list(rm).unwrap(), vec![saved.clone()]);

        assert!(reopened.remove(rm, saved.unit_of_work_id).unwrap());
        assert!(store.load(rm, saved.unit_of_work_id).unwrap().is_none());
    }
}
