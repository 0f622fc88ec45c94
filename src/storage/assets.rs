//! Content addressing and the all-or-nothing local asset store.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::collaborators::{AssetMetadata, Repository, TripleStore};
use crate::error::{NodeError, Result};

/// Parsed universal asset locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ual {
    pub blockchain: String,
    pub contract: String,
    pub token_id: u64,
}

/// `did:dkg:{blockchain}/{contract}/{tokenId}`
pub fn format_ual(blockchain: &str, contract: &str, token_id: u64) -> String {
    format!("did:dkg:{}/{}/{}", blockchain, contract.to_lowercase(), token_id)
}

pub fn parse_ual(ual: &str) -> Result<Ual> {
    let invalid = || NodeError::Validation(format!("invalid UAL {}", ual));
    let rest = ual.strip_prefix("did:dkg:").ok_or_else(invalid)?;
    let mut parts = rest.split('/');
    let (Some(blockchain), Some(contract), Some(token_id), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    if blockchain.is_empty() || contract.is_empty() {
        return Err(invalid());
    }
    Ok(Ual {
        blockchain: blockchain.to_string(),
        contract: contract.to_lowercase(),
        token_id: token_id.parse().map_err(|_| invalid())?,
    })
}

fn canonical(nquads: &[String]) -> String {
    let mut sorted: Vec<&str> = nquads.iter().map(|q| q.trim()).collect();
    sorted.sort_unstable();
    sorted.join("\n")
}

/// `0x` + hex(sha256(sorted n-quads joined by newline)).
pub fn calculate_assertion_id(nquads: &[String]) -> String {
    format!("0x{}", hex::encode(Sha256::digest(canonical(nquads).as_bytes())))
}

/// Size in bytes of the canonical serialization.
pub fn assertion_size(nquads: &[String]) -> u64 {
    canonical(nquads).len() as u64
}

/// Keyword used for neighborhood selection when the client gives none:
/// the contract address followed by the assertion id.
pub fn default_keyword(contract: &str, assertion_id: &str) -> String {
    format!(
        "0x{}{}",
        contract.trim_start_matches("0x").to_lowercase(),
        assertion_id.trim_start_matches("0x").to_lowercase()
    )
}

/// Result of a local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    /// No metadata existed for the UAL before this call
    pub asset_was_new: bool,
    /// The assertion triples were written by this call
    pub assertion_written: bool,
}

/// Writes metadata, assertion and the history copy of a replaced state as
/// one unit. A failed step undoes the steps before it.
#[derive(Clone)]
pub struct AssetStore {
    triple_store: Arc<dyn TripleStore>,
}

impl AssetStore {
    pub fn new(triple_store: Arc<dyn TripleStore>) -> Self {
        Self { triple_store }
    }

    pub fn triple_store(&self) -> &Arc<dyn TripleStore> {
        &self.triple_store
    }

    pub async fn local_store_asset(
        &self,
        repo: Repository,
        nquads: &[String],
        metadata: &AssetMetadata,
    ) -> Result<StoreOutcome> {
        let store = &self.triple_store;
        let previous = store.asset_metadata(repo, &metadata.ual).await?;
        let assertion_present = store.assertion_exists(repo, &metadata.assertion_id).await?;

        if let Some(prev) = &previous {
            if prev.assertion_id == metadata.assertion_id && assertion_present {
                debug!(ual = %metadata.ual, assertion_id = %metadata.assertion_id, "Asset already stored");
                return Ok(StoreOutcome {
                    asset_was_new: false,
                    assertion_written: false,
                });
            }
        }

        store.insert_asset_metadata(repo, metadata).await?;

        if !assertion_present {
            if let Err(e) = store
                .insert_assertion(repo, &metadata.assertion_id, nquads)
                .await
            {
                warn!(ual = %metadata.ual, error = %e, "Assertion write failed, reverting metadata");
                self.compensate(repo, metadata, previous.as_ref(), true).await;
                return Err(e);
            }
        }

        // keep the replaced state reachable through history; the triples stay
        // in current as well since another asset may share the assertion
        if let Some(prev) = &previous {
            if repo == Repository::PublicCurrent && prev.assertion_id != metadata.assertion_id {
                if let Err(e) = self.archive(prev).await {
                    warn!(ual = %metadata.ual, error = %e, "Archiving replaced state failed, reverting");
                    self.compensate(repo, metadata, previous.as_ref(), !assertion_present)
                        .await;
                    return Err(e);
                }
            }
        }

        info!(
            ual = %metadata.ual,
            assertion_id = %metadata.assertion_id,
            repository = repo.as_str(),
            "Asset stored locally"
        );
        Ok(StoreOutcome {
            asset_was_new: previous.is_none(),
            assertion_written: !assertion_present,
        })
    }

    /// Remove the asset's metadata and assertion from `repo`.
    pub async fn delete_asset(&self, repo: Repository, ual: &str) -> Result<()> {
        if let Some(metadata) = self.triple_store.asset_metadata(repo, ual).await? {
            self.triple_store
                .delete_assertion(repo, &metadata.assertion_id)
                .await?;
        }
        self.triple_store.delete_asset_metadata(repo, ual).await
    }

    /// Copy `prev` from current into history. A partial copy is removed.
    async fn archive(&self, prev: &AssetMetadata) -> Result<()> {
        let store = &self.triple_store;
        let Some(old) = store
            .get_assertion(Repository::PublicCurrent, &prev.assertion_id)
            .await?
        else {
            return Ok(());
        };
        let already_archived = store
            .assertion_exists(Repository::PublicHistory, &prev.assertion_id)
            .await?;
        store
            .insert_assertion(Repository::PublicHistory, &prev.assertion_id, &old)
            .await?;
        if let Err(e) = store.insert_asset_metadata(Repository::PublicHistory, prev).await {
            if !already_archived {
                if let Err(e) = store
                    .delete_assertion(Repository::PublicHistory, &prev.assertion_id)
                    .await
                {
                    warn!(ual = %prev.ual, error = %e, "Compensating history delete failed");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn compensate(
        &self,
        repo: Repository,
        metadata: &AssetMetadata,
        previous: Option<&AssetMetadata>,
        drop_assertion: bool,
    ) {
        let store = &self.triple_store;
        let restore = match previous {
            Some(prev) => store.insert_asset_metadata(repo, prev).await,
            None => store.delete_asset_metadata(repo, &metadata.ual).await,
        };
        if let Err(e) = restore {
            warn!(ual = %metadata.ual, error = %e, "Compensating metadata write failed");
        }
        if !drop_assertion {
            return;
        }
        if let Err(e) = store.delete_assertion(repo, &metadata.assertion_id).await {
            warn!(ual = %metadata.ual, error = %e, "Compensating assertion delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemoryTripleStore;

    fn quads() -> Vec<String> {
        vec![
            "<urn:b> <urn:p> \"2\" .".to_string(),
            "<urn:a> <urn:p> \"1\" .".to_string(),
        ]
    }

    fn metadata(assertion_id: &str) -> AssetMetadata {
        AssetMetadata {
            ual: format_ual("hardhat:31337", "0xABC", 7),
            blockchain: "hardhat:31337".to_string(),
            contract: "0xabc".to_string(),
            token_id: 7,
            keyword: "kw".to_string(),
            assertion_id: assertion_id.to_string(),
        }
    }

    #[test]
    fn test_assertion_id_ignores_order() {
        let mut reversed = quads();
        reversed.reverse();
        assert_eq!(calculate_assertion_id(&quads()), calculate_assertion_id(&reversed));
        assert!(calculate_assertion_id(&quads()).starts_with("0x"));
        assert_eq!(calculate_assertion_id(&quads()).len(), 66);
    }

    #[test]
    fn test_ual_parse() {
        let ual = format_ual("hardhat:31337", "0xABC", 7);
        assert_eq!(ual, "did:dkg:hardhat:31337/0xabc/7");
        let parsed = parse_ual(&ual).unwrap();
        assert_eq!(parsed.token_id, 7);
        assert_eq!(parsed.contract, "0xabc");
        assert!(parse_ual("did:dkg:chain/0xabc").is_err());
        assert!(parse_ual("did:dkg:chain/0xabc/seven").is_err());
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let memory = Arc::new(MemoryTripleStore::new());
        let store = AssetStore::new(memory.clone());
        let id = calculate_assertion_id(&quads());

        let first = store
            .local_store_asset(Repository::PublicCurrent, &quads(), &metadata(&id))
            .await
            .unwrap();
        assert!(first.asset_was_new && first.assertion_written);

        let second = store
            .local_store_asset(Repository::PublicCurrent, &quads(), &metadata(&id))
            .await
            .unwrap();
        assert!(!second.asset_was_new && !second.assertion_written);
        assert_eq!(memory.assertion_writes(), 1);
    }

    #[tokio::test]
    async fn test_failed_assertion_write_leaves_nothing_behind() {
        let memory = Arc::new(MemoryTripleStore::new());
        let store = AssetStore::new(memory.clone());
        memory.fail_assertion_writes(true);

        let id = calculate_assertion_id(&quads());
        let err = store
            .local_store_asset(Repository::PublicCurrent, &quads(), &metadata(&id))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(memory.metadata_count(Repository::PublicCurrent), 0);
        assert!(!memory
            .assertion_exists(Repository::PublicCurrent, &id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_failed_replacement_leaves_history_untouched() {
        let memory = Arc::new(MemoryTripleStore::new());
        let store = AssetStore::new(memory.clone());
        let old_id = calculate_assertion_id(&quads());
        store
            .local_store_asset(Repository::PublicCurrent, &quads(), &metadata(&old_id))
            .await
            .unwrap();

        memory.fail_assertion_writes_to(Repository::PublicCurrent);
        let new_quads = vec!["<urn:a> <urn:p> \"4\" .".to_string()];
        let new_id = calculate_assertion_id(&new_quads);
        store
            .local_store_asset(Repository::PublicCurrent, &new_quads, &metadata(&new_id))
            .await
            .unwrap_err();

        assert_eq!(memory.metadata_count(Repository::PublicHistory), 0);
        assert!(!memory.assertion_exists(Repository::PublicHistory, &old_id).await.unwrap());
        let current = memory
            .asset_metadata(Repository::PublicCurrent, &metadata(&old_id).ual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.assertion_id, old_id);
    }

    #[tokio::test]
    async fn test_failed_archive_reverts_current() {
        let memory = Arc::new(MemoryTripleStore::new());
        let store = AssetStore::new(memory.clone());
        let old_id = calculate_assertion_id(&quads());
        store
            .local_store_asset(Repository::PublicCurrent, &quads(), &metadata(&old_id))
            .await
            .unwrap();

        memory.fail_assertion_writes_to(Repository::PublicHistory);
        let new_quads = vec!["<urn:a> <urn:p> \"5\" .".to_string()];
        let new_id = calculate_assertion_id(&new_quads);
        store
            .local_store_asset(Repository::PublicCurrent, &new_quads, &metadata(&new_id))
            .await
            .unwrap_err();

        assert_eq!(memory.metadata_count(Repository::PublicHistory), 0);
        let current = memory
            .asset_metadata(Repository::PublicCurrent, &metadata(&old_id).ual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.assertion_id, old_id);
        assert!(!memory.assertion_exists(Repository::PublicCurrent, &new_id).await.unwrap());
        assert!(memory.assertion_exists(Repository::PublicCurrent, &old_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_replacing_assertion_archives_previous() {
        let memory = Arc::new(MemoryTripleStore::new());
        let store = AssetStore::new(memory.clone());
        let old_id = calculate_assertion_id(&quads());
        store
            .local_store_asset(Repository::PublicCurrent, &quads(), &metadata(&old_id))
            .await
            .unwrap();

        let new_quads = vec!["<urn:a> <urn:p> \"3\" .".to_string()];
        let new_id = calculate_assertion_id(&new_quads);
        let outcome = store
            .local_store_asset(Repository::PublicCurrent, &new_quads, &metadata(&new_id))
            .await
            .unwrap();
        assert!(!outcome.asset_was_new);

        assert!(memory.assertion_exists(Repository::PublicHistory, &old_id).await.unwrap());
        let current = memory
            .asset_metadata(Repository::PublicCurrent, &metadata(&new_id).ual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.assertion_id, new_id);
        assert!(memory.assertion_exists(Repository::PublicCurrent, &new_id).await.unwrap());
    }
}
