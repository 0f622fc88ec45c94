//! Triple store interface and an in-memory implementation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Repository {
    PublicCurrent,
    PublicHistory,
}

impl Repository {
    pub fn as_str(&self) -> &'static str {
        match self {
            Repository::PublicCurrent => "publicCurrent",
            Repository::PublicHistory => "publicHistory",
        }
    }
}

/// Metadata triples describing a knowledge asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMetadata {
    pub ual: String,
    pub blockchain: String,
    pub contract: String,
    pub token_id: u64,
    pub keyword: String,
    pub assertion_id: String,
}

#[async_trait]
pub trait TripleStore: Send + Sync {
    async fn insert_asset_metadata(&self, repo: Repository, metadata: &AssetMetadata) -> Result<()>;

    async fn insert_assertion(
        &self,
        repo: Repository,
        assertion_id: &str,
        nquads: &[String],
    ) -> Result<()>;

    async fn get_assertion(&self, repo: Repository, assertion_id: &str) -> Result<Option<Vec<String>>>;

    async fn assertion_exists(&self, repo: Repository, assertion_id: &str) -> Result<bool>;

    async fn asset_metadata(&self, repo: Repository, ual: &str) -> Result<Option<AssetMetadata>>;

    async fn delete_assertion(&self, repo: Repository, assertion_id: &str) -> Result<()>;

    async fn delete_asset_metadata(&self, repo: Repository, ual: &str) -> Result<()>;
}

/// In-memory triple store with write counters and fault injection.
#[derive(Default)]
pub struct MemoryTripleStore {
    assertions: DashMap<(Repository, String), Vec<String>>,
    metadata: DashMap<(Repository, String), AssetMetadata>,
    assertion_writes: AtomicUsize,
    fail_assertion_writes: AtomicBool,
    failing_repos: DashSet<Repository>,
    fail_reads: AtomicBool,
}

impl MemoryTripleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of assertion inserts that reached the store.
    pub fn assertion_writes(&self) -> usize {
        self.assertion_writes.load(Ordering::SeqCst)
    }

    /// Make every assertion insert fail with a storage error.
    pub fn fail_assertion_writes(&self, fail: bool) {
        self.fail_assertion_writes.store(fail, Ordering::SeqCst);
    }

    /// Make assertion inserts into `repo` fail with a storage error.
    pub fn fail_assertion_writes_to(&self, repo: Repository) {
        self.failing_repos.insert(repo);
    }

    /// Make every read fail with a storage error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn metadata_count(&self, repo: Repository) -> usize {
        self.metadata.iter().filter(|e| e.key().0 == repo).count()
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(NodeError::Storage("triple store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TripleStore for MemoryTripleStore {
    async fn insert_asset_metadata(&self, repo: Repository, metadata: &AssetMetadata) -> Result<()> {
        self.metadata
            .insert((repo, metadata.ual.clone()), metadata.clone());
        Ok(())
    }

    async fn insert_assertion(
        &self,
        repo: Repository,
        assertion_id: &str,
        nquads: &[String],
    ) -> Result<()> {
        if self.fail_assertion_writes.load(Ordering::SeqCst) || self.failing_repos.contains(&repo) {
            return Err(NodeError::Storage(format!(
                "failed to insert assertion {}",
                assertion_id
            )));
        }
        self.assertions
            .insert((repo, assertion_id.to_string()), nquads.to_vec());
        self.assertion_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_assertion(&self, repo: Repository, assertion_id: &str) -> Result<Option<Vec<String>>> {
        self.check_reads()?;
        Ok(self
            .assertions
            .get(&(repo, assertion_id.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn assertion_exists(&self, repo: Repository, assertion_id: &str) -> Result<bool> {
        self.check_reads()?;
        Ok(self.assertions.contains_key(&(repo, assertion_id.to_string())))
    }

    async fn asset_metadata(&self, repo: Repository, ual: &str) -> Result<Option<AssetMetadata>> {
        self.check_reads()?;
        Ok(self
            .metadata
            .get(&(repo, ual.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn delete_assertion(&self, repo: Repository, assertion_id: &str) -> Result<()> {
        self.assertions.remove(&(repo, assertion_id.to_string()));
        Ok(())
    }

    async fn delete_asset_metadata(&self, repo: Repository, ual: &str) -> Result<()> {
        self.metadata.remove(&(repo, ual.to_string()));
        Ok(())
    }
}
