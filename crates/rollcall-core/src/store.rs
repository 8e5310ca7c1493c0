//! Template persistence seam.
//!
//! The core only needs `get`/`put` with last-writer-wins per identity;
//! `remove` and `list` exist for administration. [`MemoryTemplateStore`]
//! satisfies the contract without any backing service.

use crate::matcher::Roster;
use crate::types::{IdentityId, Template};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored template for {identity} is corrupt: {reason}")]
    Corrupt { identity: String, reason: String },
    #[error("write rejected: {0}")]
    Rejected(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Template for `id`, or `None` if the identity never enrolled.
    async fn get(&self, id: &IdentityId) -> StoreResult<Option<Template>>;

    /// Store `template` under its identity, replacing any previous one.
    async fn put(&self, template: &Template) -> StoreResult<()>;

    /// Delete the template for `id`. Returns whether one existed.
    async fn remove(&self, id: &IdentityId) -> StoreResult<bool>;

    /// Every stored template, ordered by identity.
    async fn list(&self) -> StoreResult<Vec<Template>>;
}

/// Build a roster for `ids`, returning it with the identities that have no template.
pub async fn load_roster(
    store: &dyn TemplateStore,
    ids: &[IdentityId],
) -> StoreResult<(Roster, Vec<IdentityId>)> {
    let mut roster = Roster::new();
    let mut missing = Vec::new();
    for id in ids {
        match store.get(id).await? {
            Some(template) => {
                roster.insert(template);
            }
            None => missing.push(id.clone()),
        }
    }
    if !missing.is_empty() {
        tracing::debug!(missing = missing.len(), "roster identities without a template");
    }
    Ok((roster, missing))
}

/// In-memory store backed by a `HashMap<IdentityId, Template>`.
#[derive(Debug, Default)]
pub struct MemoryTemplateStore {
    templates: Mutex<HashMap<IdentityId, Template>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn get(&self, id: &IdentityId) -> StoreResult<Option<Template>> {
        Ok(self.templates.lock().await.get(id).cloned())
    }

    async fn put(&self, template: &Template) -> StoreResult<()> {
        self.templates
            .lock()
            .await
            .insert(template.identity_id.clone(), template.clone());
        Ok(())
    }

    async fn remove(&self, id: &IdentityId) -> StoreResult<bool> {
        Ok(self.templates.lock().await.remove(id).is_some())
    }

    async fn list(&self) -> StoreResult<Vec<Template>> {
        let mut all: Vec<Template> = self.templates.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));
        Ok(all)
    }
}
