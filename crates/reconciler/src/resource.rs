//! Two-snapshot view of a reconciled object.
//!
//! Handlers mutate the `changed` snapshot freely; `current` stays the
//! as-fetched object so a handler can diff against what the cluster
//! currently holds. The status is written back exactly once per pass,
//! and only when it actually differs.

use std::fmt::Debug;

use kube::api::{Api, Patch, PatchParams};
use kube::core::object::HasStatus;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("serialize status: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// The object under reconciliation, as fetched and as mutated.
#[derive(Debug, Clone)]
pub struct ReconciledResource<K> {
    /// The object exactly as read from the cluster.
    pub current: K,

    /// The working copy handlers mutate during the pass.
    pub changed: K,
}

impl<K> ReconciledResource<K>
where
    K: Clone + HasStatus,
{
    pub fn new(obj: K) -> Self {
        Self {
            changed: obj.clone(),
            current: obj,
        }
    }

    /// Working status, created on first access.
    pub fn status_mut(&mut self) -> &mut K::Status
    where
        K::Status: Default,
    {
        self.changed.status_mut().get_or_insert_with(K::Status::default)
    }
}

impl<K> ReconciledResource<K>
where
    K: Clone + HasStatus + Resource<DynamicType = ()> + Serialize + DeserializeOwned + Debug,
    K::Status: Serialize,
{
    /// True when the working status diverged from the fetched one.
    ///
    /// Compared through their serialized forms, so field order and
    /// skipped defaults follow the wire representation.
    pub fn status_changed(&self) -> Result<bool, serde_json::Error> {
        let before = serde_json::to_value(self.current.status())?;
        let after = serde_json::to_value(self.changed.status())?;
        Ok(before != after)
    }

    /// Writes the working status back, once, if it changed.
    pub async fn persist_status(
        &self,
        api: &Api<K>,
        manager: &str,
    ) -> Result<(), PersistError> {
        if !self.status_changed()? {
            return Ok(());
        }
        let patch = serde_json::json!({ "status": self.changed.status() });
        let params = PatchParams {
            field_manager: Some(manager.to_owned()),
            ..PatchParams::default()
        };
        api.patch_status(&self.changed.name_any(), &params, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "resource_test.rs"]
mod resource_test;
