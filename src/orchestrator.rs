//! Optional distributed refresh backend. Instead of pulling the origin
//! itself, the mirror creates a named blob resource describing the
//! transfer and waits for the orchestrating service to drive it to a
//! terminal phase, observed through an event subscription.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::fetch::NotOk;

pub const DEFAULT_MAXIMUM_RUNNING: i32 = 10;
pub const DEFAULT_MINIMUM_CHUNK_SIZE: i64 = 128 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BlobCondition {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct BlobStatus {
    pub phase: BlobPhase,
    pub conditions: Vec<BlobCondition>,
}

#[derive(Debug, Clone)]
pub struct BlobDestination {
    pub name: String,
    pub path: String,
    pub skip_if_exists: bool,
}

#[derive(Debug, Clone)]
pub struct BlobSpec {
    pub maximum_running: i32,
    pub minimum_chunk_size: i64,
    pub source_url: String,
    pub destination: BlobDestination,
}

#[derive(Debug, Clone)]
pub struct Blob {
    /// Hex MD5 of the cache key.
    pub name: String,
    /// Human-readable label, carries the source URL.
    pub display_name: String,
    pub spec: BlobSpec,
    pub status: BlobStatus,
}

#[derive(Debug, Clone)]
pub enum BlobEvent {
    /// A blob was created or its status changed.
    Applied(Blob),
    /// The named blob was removed before reaching a terminal phase.
    Deleted(String),
}

/// Client for the orchestrating service. Implementations live outside this
/// crate; `subscribe` must deliver every phase transition, and receivers
/// that lag may re-read state through `get`.
#[async_trait]
pub trait BlobClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Blob>>;

    /// Creates the blob, or returns the existing one when the name is
    /// already taken.
    async fn create(&self, blob: Blob) -> Result<Blob>;

    fn subscribe(&self) -> broadcast::Receiver<BlobEvent>;
}

pub fn blob_name(cache_key: &str) -> String {
    format!("{:x}", md5::compute(cache_key.as_bytes()))
}

pub struct Orchestrator {
    client: Arc<dyn BlobClient>,
    destination: String,
    maximum_running: i32,
    minimum_chunk_size: i64,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn BlobClient>, destination: impl Into<String>) -> Self {
        Self {
            client,
            destination: destination.into(),
            maximum_running: DEFAULT_MAXIMUM_RUNNING,
            minimum_chunk_size: DEFAULT_MINIMUM_CHUNK_SIZE,
        }
    }

    pub fn with_limits(mut self, maximum_running: i32, minimum_chunk_size: i64) -> Self {
        self.maximum_running = maximum_running;
        self.minimum_chunk_size = minimum_chunk_size;
        self
    }

    /// Creates or adopts the blob for `cache_key` and waits for a terminal
    /// phase. Failure wraps `NotOk` with the first non-empty condition
    /// message so the handler maps it like any other unusable origin.
    pub async fn sync(&self, source_url: &str, cache_key: &str) -> Result<()> {
        let name = blob_name(cache_key);

        // Subscribe before reading state so a transition between the two
        // cannot be missed.
        let mut events = self.client.subscribe();

        let blob = match self.client.get(&name).await? {
            Some(blob) => blob,
            None => {
                self.client
                    .create(Blob {
                        name: name.clone(),
                        display_name: source_url.to_string(),
                        spec: BlobSpec {
                            maximum_running: self.maximum_running,
                            minimum_chunk_size: self.minimum_chunk_size,
                            source_url: source_url.to_string(),
                            destination: BlobDestination {
                                name: self.destination.clone(),
                                path: cache_key.to_string(),
                                skip_if_exists: true,
                            },
                        },
                        status: BlobStatus {
                            phase: BlobPhase::Pending,
                            conditions: Vec::new(),
                        },
                    })
                    .await?
            }
        };

        if let Some(outcome) = terminal_outcome(&blob) {
            return outcome;
        }

        loop {
            match events.recv().await {
                Ok(BlobEvent::Applied(updated)) if updated.name == name => {
                    if let Some(outcome) = terminal_outcome(&updated) {
                        return outcome;
                    }
                }
                Ok(BlobEvent::Deleted(deleted)) if deleted == name => {
                    return Err(anyhow!("blob {name} was deleted before completion"));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(blob) = self.client.get(&name).await? {
                        if let Some(outcome) = terminal_outcome(&blob) {
                            return outcome;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow!("blob {name} event stream closed before completion"));
                }
            }
        }
    }
}

fn terminal_outcome(blob: &Blob) -> Option<Result<()>> {
    match blob.status.phase {
        BlobPhase::Succeeded => Some(Ok(())),
        BlobPhase::Failed => {
            let message = blob
                .status
                .conditions
                .iter()
                .map(|c| c.message.as_str())
                .find(|m| !m.is_empty())
                .unwrap_or("blob sync failed");
            Some(Err(anyhow::Error::new(NotOk).context(format!("failed: {message}"))))
        }
        BlobPhase::Pending | BlobPhase::Running => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_names_are_hex_md5() {
        let name = blob_name("example.com/file.txt");
        assert_eq!(name.len(), 32);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, blob_name("example.com/file.txt"));
        assert_ne!(name, blob_name("example.com/other.txt"));
        // Stable digest, independently computed.
        assert_eq!(blob_name(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn failed_blobs_surface_first_condition_message() {
        let blob = Blob {
            name: "n".to_string(),
            display_name: "https://example.com/a".to_string(),
            spec: BlobSpec {
                maximum_running: 1,
                minimum_chunk_size: 1,
                source_url: "https://example.com/a".to_string(),
                destination: BlobDestination {
                    name: "s3".to_string(),
                    path: "example.com/a".to_string(),
                    skip_if_exists: true,
                },
            },
            status: BlobStatus {
                phase: BlobPhase::Failed,
                conditions: vec![
                    BlobCondition {
                        message: String::new(),
                    },
                    BlobCondition {
                        message: "origin unreachable".to_string(),
                    },
                ],
            },
        };
        let err = terminal_outcome(&blob).expect("terminal").unwrap_err();
        assert!(crate::fetch::is_not_ok(&err));
        assert!(format!("{err:#}").contains("origin unreachable"));
    }
}
