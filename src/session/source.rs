use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::ExamRef;
use crate::policy::LockdownPolicy;

/// Where the policy for an exam comes from. Fetched once per session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch(&self, exam: &ExamRef) -> Result<LockdownPolicy>;
}

/// One policy file for every exam, TOML or JSON by extension.
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn fetch(&self, _exam: &ExamRef) -> Result<LockdownPolicy> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read policy {}", self.path.display()))?;
        let is_json = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let policy = if is_json {
            LockdownPolicy::from_json_str(&content)
        } else {
            LockdownPolicy::from_toml_str(&content)
        };
        policy.with_context(|| format!("Failed to parse policy {}", self.path.display()))
    }
}
