//! Remote bucket operations that are not part of a run: listing folders and
//! purging old run artifacts. Both go through the transfer tool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TransferConfig;
use crate::error::RemoteError;
use crate::model::Bucket;
use crate::transfer::command::{build_lsjson, build_purge, Invocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// One child of a remote folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Access to what runs have written into a bucket.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Removes `path` and everything below it. A missing path is not an error.
    async fn delete(&self, bucket: &Bucket, path: &str) -> Result<(), RemoteError>;

    /// Lists the direct children of `path`, folders first.
    async fn list(&self, bucket: &Bucket, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;
}

/// [`ArtifactStore`] backed by the transfer tool's `purge` and `lsjson`.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    config: TransferConfig,
}

impl RemoteClient {
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    async fn run(&self, invocation: Invocation) -> Result<String, RemoteError> {
        log::debug!("Running: {}", invocation.describe());
        let output = invocation
            .command()
            .output()
            .await
            .map_err(|e| RemoteError::Spawn {
                binary: invocation.program.clone(),
                source: e,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim();
            Err(RemoteError::CommandFailed(if message.is_empty() {
                format!("exit code {}", output.status.code().unwrap_or(-1))
            } else {
                message.to_string()
            }))
        }
    }
}

#[async_trait]
impl ArtifactStore for RemoteClient {
    async fn delete(&self, bucket: &Bucket, path: &str) -> Result<(), RemoteError> {
        if path.trim_matches('/').is_empty() {
            return Err(RemoteError::CommandFailed(
                "Refusing to purge the bucket root".to_string(),
            ));
        }

        match self.run(build_purge(&self.config, bucket, path)).await {
            Ok(_) => Ok(()),
            Err(RemoteError::CommandFailed(message)) if is_not_found(&message) => {
                log::debug!("Artifact path {} already gone", path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self, bucket: &Bucket, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let stdout = self.run(build_lsjson(&self.config, bucket, path)).await?;
        parse_lsjson(&stdout)
    }
}

fn is_not_found(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("directory not found") || message.contains("object not found")
}

#[derive(Debug, Deserialize)]
struct LsJsonItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Size", default)]
    size: i64,
    #[serde(rename = "IsDir", default)]
    is_dir: bool,
}

/// Parses `lsjson` output into entries, folders first then by name.
pub fn parse_lsjson(stdout: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }

    let items: Vec<LsJsonItem> = serde_json::from_str(stdout)?;
    let mut entries: Vec<RemoteEntry> = items
        .into_iter()
        .map(|item| RemoteEntry {
            name: item.name,
            kind: if item.is_dir {
                EntryKind::Dir
            } else {
                EntryKind::File
            },
            size: if item.is_dir || item.size < 0 {
                None
            } else {
                Some(item.size as u64)
            },
        })
        .collect();

    entries.sort_by(|a, b| {
        (a.kind != EntryKind::Dir)
            .cmp(&(b.kind != EntryKind::Dir))
            .then_with(|| a.name.cmp(&b.name))
    });

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_lsjson() {
        let stdout = r#"[
            {"Path":"notes.txt","Name":"notes.txt","Size":120,"MimeType":"text/plain","ModTime":"2026-01-01T02:00:00Z","IsDir":false},
            {"Path":"photos","Name":"photos","Size":-1,"MimeType":"inode/directory","ModTime":"2026-01-01T02:00:00Z","IsDir":true},
            {"Path":"archive","Name":"archive","Size":0,"IsDir":true}
        ]"#;

        let entries = parse_lsjson(stdout).unwrap();
        assert_eq!(
            entries,
            vec![
                RemoteEntry {
                    name: "archive".to_string(),
                    kind: EntryKind::Dir,
                    size: None
                },
                RemoteEntry {
                    name: "photos".to_string(),
                    kind: EntryKind::Dir,
                    size: None
                },
                RemoteEntry {
                    name: "notes.txt".to_string(),
                    kind: EntryKind::File,
                    size: Some(120)
                },
            ]
        );
    }

    #[test]
    fn test_parse_lsjson_empty_and_invalid() {
        assert!(parse_lsjson("").unwrap().is_empty());
        assert!(parse_lsjson("[]").unwrap().is_empty());
        assert!(matches!(parse_lsjson("not json"), Err(RemoteError::Parse(_))));
    }

    #[test]
    fn test_entry_serializes_type_field() {
        let entry = RemoteEntry {
            name: "docs".to_string(),
            kind: EntryKind::Dir,
            size: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json, serde_json::json!({"name": "docs", "type": "dir"}));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found("ERROR : directory not found"));
        assert!(!is_not_found("AccessDenied"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let client = RemoteClient::new(TransferConfig {
            binary: PathBuf::from("/nonexistent/cloudstash-transfer"),
            ..Default::default()
        });
        let bucket = Bucket::new("b", "bucket", "k", "s");

        let result = client.list(&bucket, "").await;
        assert!(matches!(result, Err(RemoteError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_refuses_to_purge_root() {
        let client = RemoteClient::new(TransferConfig::default());
        let bucket = Bucket::new("b", "bucket", "k", "s");

        let result = client.delete(&bucket, "/").await;
        assert!(matches!(result, Err(RemoteError::CommandFailed(_))));
    }
}
