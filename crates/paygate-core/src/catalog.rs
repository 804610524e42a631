//! ============================================================================
//! Catalog - Content flags and account tiers from external stores
//! ============================================================================
//! The CMS and the subscription system own this data; the gate only reads
//! it. `Directory` is a file-backed stand-in for both, loaded from JSON:
//!
//! ```json
//! {
//!   "accounts": { "acct-7": "premium" },
//!   "content":  { "market-wrap": { "premium": false } }
//! }
//! ```
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::access::{AccountDirectory, SubscriptionTier};
use crate::types::ContentFlag;

/// Content store owned by the CMS
#[async_trait]
pub trait ContentCatalog: Send + Sync {
    /// Premium flag of a content item, None if the item does not exist
    async fn content_flag(&self, content_id: &str) -> Result<Option<ContentFlag>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentEntry {
    #[serde(default)]
    pub premium: bool,
}

/// In-memory accounts and content, optionally loaded from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Directory {
    #[serde(default)]
    accounts: HashMap<String, SubscriptionTier>,
    #[serde(default)]
    content: HashMap<String, ContentEntry>,
}

impl Directory {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read directory {}: {}", path.display(), e))?;
        let directory: Directory = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("Failed to parse directory {}: {}", path.display(), e))?;

        info!(
            "Loaded directory {}: {} accounts, {} content items",
            path.display(),
            directory.accounts.len(),
            directory.content.len()
        );
        Ok(directory)
    }

    pub fn with_account(mut self, account_id: impl Into<String>, tier: SubscriptionTier) -> Self {
        self.accounts.insert(account_id.into(), tier);
        self
    }

    pub fn with_content(mut self, content_id: impl Into<String>, premium: bool) -> Self {
        self.content.insert(content_id.into(), ContentEntry { premium });
        self
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn content_count(&self) -> usize {
        self.content.len()
    }
}

#[async_trait]
impl AccountDirectory for Directory {
    async fn subscription_tier(&self, account_id: &str) -> Result<Option<SubscriptionTier>> {
        Ok(self.accounts.get(account_id).copied())
    }
}

#[async_trait]
impl ContentCatalog for Directory {
    async fn content_flag(&self, content_id: &str) -> Result<Option<ContentFlag>> {
        Ok(self
            .content
            .get(content_id)
            .map(|entry| ContentFlag::new(content_id, entry.premium)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directory_json() {
        let raw = r#"{
            "accounts": { "a1": "elite", "a2": "free" },
            "content": { "c1": { "premium": true }, "c2": {} }
        }"#;
        let directory: Directory = serde_json::from_str(raw).unwrap();
        assert_eq!(directory.account_count(), 2);
        assert_eq!(directory.content_count(), 2);
        assert!(directory.content["c1"].premium);
        assert!(!directory.content["c2"].premium);
    }

    #[test]
    fn test_missing_sections_default_empty() {
        let directory: Directory = serde_json::from_str("{}").unwrap();
        assert_eq!(directory.account_count(), 0);
        assert_eq!(directory.content_count(), 0);
    }

    #[tokio::test]
    async fn test_lookups() {
        let directory = Directory::default()
            .with_account("a1", SubscriptionTier::Premium)
            .with_content("c1", true);

        assert_eq!(
            directory.subscription_tier("a1").await.unwrap(),
            Some(SubscriptionTier::Premium)
        );
        assert_eq!(directory.subscription_tier("nobody").await.unwrap(), None);
        assert_eq!(
            directory.content_flag("c1").await.unwrap(),
            Some(ContentFlag::new("c1", true))
        );
        assert_eq!(directory.content_flag("missing").await.unwrap(), None);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = Directory::load(Path::new("/nonexistent/paygate-directory.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read directory"));
    }
}
