//! In-memory microVM record store.
//!
//! Records live in a plain `Vec` in insertion order. There is no index: every
//! lookup is a linear scan. Removal swaps the last record into the freed slot,
//! so deletes do not preserve the order of the remaining records.

use rand::TryRngCore;
use rand::rngs::OsRng;
use tracing::{debug, info};

use crate::error::{SafetyError, SafetyResult};
use crate::proto::types::micro_vm_status::MicroVmState;
use crate::proto::types::{MicroVm, MicroVmSpec, MicroVmStatus};

/// Source of server-assigned microVM uids.
pub trait UidSource: Send + Sync + std::fmt::Debug {
    fn next_uid(&self) -> SafetyResult<String>;
}

/// Random (version 4) UUIDs drawn from the operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomUid;

impl UidSource for RandomUid {
    fn next_uid(&self) -> SafetyResult<String> {
        let mut bytes = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| SafetyError::IdentifierGeneration(e.to_string()))?;
        Ok(uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string())
    }
}

#[derive(Debug)]
pub struct MicroVmStore {
    specs: Vec<MicroVmSpec>,
    uids: Box<dyn UidSource>,
}

impl Default for MicroVmStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MicroVmStore {
    pub fn new() -> Self {
        Self::with_uid_source(Box::new(RandomUid))
    }

    pub fn with_uid_source(uids: Box<dyn UidSource>) -> Self {
        Self {
            specs: Vec::new(),
            uids,
        }
    }

    /// Replace the whole collection. Used to seed test state.
    pub fn load(&mut self, specs: impl IntoIterator<Item = MicroVmSpec>) {
        self.specs = specs.into_iter().collect();
        debug!(count = self.specs.len(), "microvm store loaded");
    }

    /// Assign a fresh uid to `spec` and append it.
    ///
    /// The returned record has version 0 and an empty status.
    pub fn create(&mut self, mut spec: MicroVmSpec) -> SafetyResult<MicroVm> {
        let uid = self.uids.next_uid()?;
        spec.uid = Some(uid);

        self.specs.push(spec.clone());

        info!(
            id = %spec.id,
            namespace = %spec.namespace,
            uid = spec.uid.as_deref().unwrap_or_default(),
            "microvm created"
        );

        Ok(MicroVm {
            version: 0,
            spec: Some(spec),
            status: Some(MicroVmStatus::default()),
        })
    }

    /// Remove every record carrying `uid` and return how many went.
    ///
    /// An unknown uid is not an error.
    pub fn delete(&mut self, uid: &str) -> usize {
        let mut removed = 0;
        let mut i = 0;

        while i < self.specs.len() {
            if self.specs[i].uid.as_deref() == Some(uid) {
                let spec = unordered_remove(&mut self.specs, i);
                info!(id = %spec.id, uid = %uid, "microvm deleted");
                removed += 1;
                // the slot now holds the former last record, check it too
            } else {
                i += 1;
            }
        }

        removed
    }

    pub fn get(&self, uid: &str) -> SafetyResult<MicroVm> {
        let spec = self
            .specs
            .iter()
            .rfind(|spec| spec.uid.as_deref() == Some(uid))
            .ok_or_else(|| SafetyError::NotFound {
                uid: uid.to_string(),
            })?;

        debug!(id = %spec.id, uid = %uid, "microvm found");

        Ok(created(spec.clone()))
    }

    /// Records matching the listing filter, in collection order.
    ///
    /// An empty `namespace` matches everything, even when `name` is set.
    pub fn list(&self, name: Option<&str>, namespace: &str) -> Vec<MicroVm> {
        self.specs
            .iter()
            .filter(|spec| should_return(spec, name, namespace))
            .cloned()
            .map(created)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[MicroVmSpec] {
        &self.specs
    }
}

fn should_return(spec: &MicroVmSpec, name: Option<&str>, namespace: &str) -> bool {
    if namespace.is_empty() {
        return true;
    }

    if spec.namespace != namespace {
        return false;
    }

    match name {
        None | Some("") => true,
        Some(name) => spec.id == name,
    }
}

/// Remove `items[index]` by moving the last element into its slot.
///
/// O(1), but the order of the remaining elements is not preserved.
fn unordered_remove<T>(items: &mut Vec<T>, index: usize) -> T {
    items.swap_remove(index)
}

fn created(spec: MicroVmSpec) -> MicroVm {
    let mut status = MicroVmStatus::default();
    status.set_state(MicroVmState::Created);

    MicroVm {
        version: 0,
        spec: Some(spec),
        status: Some(status),
    }
}
