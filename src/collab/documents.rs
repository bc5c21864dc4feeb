use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{DocumentKind, DocumentStore};
use crate::models::WorkItem;

/// Writes artefacts to `{root}/{identifier}/{kind}.md`.
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn save(&self, item: &WorkItem, kind: DocumentKind, content: &str) -> Result<String> {
        let dir = self.root.join(&item.identifier);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.md", kind.as_str()));
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path.display().to_string())
    }
}
