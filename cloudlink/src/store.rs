//! Configuration store and service directory seams used by the stack
//! assembler, with an in-memory implementation of both.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CloudError, Result};

pub type Properties = BTreeMap<String, Value>;

/// A registered configuration instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInstance {
    pub pid: String,
    pub factory_pid: String,
    pub properties: Properties,
}

pub trait ConfigurationStore: Send + Sync {
    /// Creates the instance `pid` of `factory_pid`. With `take_snapshot` the
    /// store persists its whole state once the instance exists.
    fn create_factory_configuration(
        &self,
        factory_pid: &str,
        pid: &str,
        properties: Properties,
        take_snapshot: bool,
    ) -> Result<()>;

    fn delete_factory_configuration(&self, pid: &str, take_snapshot: bool) -> Result<()>;

    fn snapshot(&self) -> Result<()>;
}

/// Lists the instances currently known to the runtime.
pub trait ServiceDirectory: Send + Sync {
    fn instances(&self) -> Vec<ServiceInstance>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOperation {
    Create { pid: String, take_snapshot: bool },
    Delete { pid: String, take_snapshot: bool },
    Snapshot,
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<String, ServiceInstance>,
    operations: Vec<StoreOperation>,
    snapshots: usize,
    fail_on: BTreeSet<String>,
}

/// In-memory store and directory. Every instance it holds is visible through
/// [`ServiceDirectory`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Makes the next creation of `pid` fail.
    pub fn fail_on_create<P: Into<String>>(&self, pid: P) {
        self.inner.write().fail_on.insert(pid.into());
    }

    #[inline]
    pub fn operations(&self) -> Vec<StoreOperation> {
        self.inner.read().operations.clone()
    }

    #[inline]
    pub fn snapshots(&self) -> usize {
        self.inner.read().snapshots
    }

    #[inline]
    pub fn pids(&self) -> Vec<String> {
        self.inner.read().instances.keys().cloned().collect()
    }

    #[inline]
    pub fn get(&self, pid: &str) -> Option<ServiceInstance> {
        self.inner.read().instances.get(pid).cloned()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.read().instances.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.read().instances.is_empty()
    }
}

impl ConfigurationStore for MemoryStore {
    fn create_factory_configuration(
        &self,
        factory_pid: &str,
        pid: &str,
        properties: Properties,
        take_snapshot: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.fail_on.remove(pid) {
            return Err(CloudError::Store(anyhow!("create {} failed", pid)));
        }
        if inner.instances.contains_key(pid) {
            return Err(CloudError::Store(anyhow!("configuration {} already exists", pid)));
        }
        inner.instances.insert(
            pid.to_owned(),
            ServiceInstance { pid: pid.to_owned(), factory_pid: factory_pid.to_owned(), properties },
        );
        inner.operations.push(StoreOperation::Create { pid: pid.to_owned(), take_snapshot });
        if take_snapshot {
            inner.snapshots += 1;
        }
        Ok(())
    }

    fn delete_factory_configuration(&self, pid: &str, take_snapshot: bool) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.instances.remove(pid).is_none() {
            return Err(CloudError::Store(anyhow!("configuration {} not found", pid)));
        }
        inner.operations.push(StoreOperation::Delete { pid: pid.to_owned(), take_snapshot });
        if take_snapshot {
            inner.snapshots += 1;
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.operations.push(StoreOperation::Snapshot);
        inner.snapshots += 1;
        Ok(())
    }
}

impl ServiceDirectory for MemoryStore {
    fn instances(&self) -> Vec<ServiceInstance> {
        self.inner.read().instances.values().cloned().collect()
    }
}
