use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use super::SourceControl;
use crate::models::WorkItem;

/// Convert a title to a branch-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

#[derive(Deserialize)]
struct FileChange {
    path: String,
    content: String,
}

/// Publishes generated changes with `git` and `gh pr create`.
pub struct GhSourceControl {
    repo_path: PathBuf,
    branch_prefix: String,
}

impl GhSourceControl {
    pub fn new(repo_path: &Path, branch_prefix: &str) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            branch_prefix: branch_prefix.to_string(),
        }
    }

    pub fn branch_name(&self, item: &WorkItem) -> String {
        format!(
            "{}/{}-{}",
            self.branch_prefix,
            item.identifier.to_lowercase(),
            slugify(&item.title, 40)
        )
    }

    async fn git(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
        if !output.status.success() {
            anyhow::bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl SourceControl for GhSourceControl {
    async fn open_pull_request(&self, item: &WorkItem, changes: &Value) -> Result<String> {
        let files: Vec<FileChange> = serde_json::from_value(
            changes.get("files").cloned().unwrap_or(Value::Array(Vec::new())),
        )
        .context("Generated changes have an invalid 'files' list")?;
        if files.is_empty() {
            anyhow::bail!("No file changes to publish for {}", item.identifier);
        }

        let branch = self.branch_name(item);
        self.git(&["checkout", "-B", &branch]).await?;
        for file in &files {
            let target = self.repo_path.join(&file.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            tokio::fs::write(&target, &file.content)
                .await
                .with_context(|| format!("Failed to write {}", target.display()))?;
            self.git(&["add", &file.path]).await?;
        }
        let title = format!("{}: {}", item.identifier, item.title);
        self.git(&["commit", "-m", &title]).await?;
        self.git(&["push", "-u", "origin", &branch]).await?;

        let summary = changes
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("No summary provided.");
        let body = format!(
            "## Summary\n\n{}\n\nTracker issue: **{}**\n\n---\n*Opened by forgeflow*",
            summary, item.identifier
        );
        let output = Command::new("gh")
            .args(["pr", "create", "--title", &title, "--body", &body, "--head", &branch])
            .current_dir(&self.repo_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run gh pr create")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to create PR: {}", stderr);
        }

        let pr_url = String::from_utf8(output.stdout)
            .context("Invalid UTF-8 in gh output")?
            .trim()
            .to_string();
        Ok(pr_url)
    }
}
