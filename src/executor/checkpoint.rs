// Checkpoint system for resumable play execution

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::failure::{AbortReason, FailureTracker};
use super::ledger::ResultLedger;
use super::play::{ResumeOptions, StartAt};
use crate::output::errors::ConductorError;
use crate::parser::ast::Play;

/// Current checkpoint format version
const CHECKPOINT_VERSION: &str = "1.0";

/// Where an unfinished play stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version
    pub version: String,
    pub play_name: String,
    /// SHA256 of task names, handler names and policy (to detect changes)
    pub play_hash: String,
    /// Hosts in scope for the run that produced this checkpoint
    pub hosts: Vec<String>,
    /// Highest task index every in-scope, non-excluded host completed
    pub last_completed_task_index: Option<usize>,
    pub excluded_hosts: Vec<String>,
    pub failed_hosts: Vec<String>,
    pub abort_reason: Option<AbortReason>,
    /// When this checkpoint was created
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Capture the state of a finished (or aborted) run
    pub fn capture(
        play: &Play,
        hosts: &[String],
        ledger: &ResultLedger,
        tracker: &FailureTracker,
        start_index: usize,
    ) -> Self {
        let excluded = tracker.excluded_hosts();
        let remaining: Vec<&String> = hosts.iter().filter(|h| !excluded.contains(h)).collect();

        // tasks before the start index were done by an earlier run
        let mut last_completed = start_index.checked_sub(1);
        for index in start_index..play.tasks.len() {
            if remaining.iter().all(|h| ledger.has_task(h, index)) {
                last_completed = Some(index);
            } else {
                break;
            }
        }

        Checkpoint {
            version: CHECKPOINT_VERSION.to_string(),
            play_name: play.name.clone(),
            play_hash: play_hash(play),
            hosts: hosts.to_vec(),
            last_completed_task_index: last_completed,
            excluded_hosts: excluded,
            failed_hosts: tracker.failed_hosts(),
            abort_reason: tracker.abort_reason(),
            timestamp: Utc::now(),
        }
    }

    /// Verify the checkpoint was taken from this play
    pub fn verify(&self, play: &Play) -> Result<(), ConductorError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(ConductorError::Checkpoint {
                message: format!(
                    "Checkpoint version mismatch: expected {}, found {}",
                    CHECKPOINT_VERSION, self.version
                ),
                suggestion: Some("Delete the checkpoint and run from the beginning".to_string()),
            });
        }

        if self.play_hash != play_hash(play) {
            return Err(ConductorError::Checkpoint {
                message: format!(
                    "Play '{}' has been modified since the checkpoint was created",
                    self.play_name
                ),
                suggestion: Some("Delete the checkpoint and run from the beginning".to_string()),
            });
        }

        Ok(())
    }

    /// Continue after the last completed task on the hosts still in play
    pub fn resume_options(&self) -> ResumeOptions {
        let limit: Vec<String> = self
            .hosts
            .iter()
            .filter(|h| !self.excluded_hosts.contains(h))
            .cloned()
            .collect();

        let options = ResumeOptions::new().with_limit(limit);
        match self.last_completed_task_index {
            Some(index) => options.with_start_at(StartAt::Index(index + 1)),
            None => options,
        }
    }

    /// Re-run the whole play on the hosts that were excluded
    pub fn retry_options(&self) -> ResumeOptions {
        ResumeOptions::new().with_limit(self.excluded_hosts.clone())
    }
}

/// Manager for checkpoint persistence and loading
pub struct CheckpointManager {
    /// Directory for storing checkpoints
    checkpoint_dir: PathBuf,
}

impl CheckpointManager {
    /// Create checkpoint manager with custom directory
    pub fn with_dir(checkpoint_dir: impl Into<PathBuf>) -> Result<Self, ConductorError> {
        let checkpoint_dir = checkpoint_dir.into();
        // Create checkpoint directory if it doesn't exist
        if !checkpoint_dir.exists() {
            fs::create_dir_all(&checkpoint_dir).map_err(|e| ConductorError::Io {
                message: format!("Failed to create checkpoint directory: {}", e),
                path: Some(checkpoint_dir.clone()),
            })?;
        }

        Ok(CheckpointManager { checkpoint_dir })
    }

    /// Get the checkpoint file path for a play
    pub fn checkpoint_path(&self, play_name: &str) -> PathBuf {
        let hash = calculate_hash(play_name);
        self.checkpoint_dir.join(format!("{}.json", &hash[..16]))
    }

    /// Save a checkpoint to disk
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, ConductorError> {
        let path = self.checkpoint_path(&checkpoint.play_name);

        let json = serde_json::to_string_pretty(checkpoint).map_err(|e| ConductorError::Checkpoint {
            message: format!("Failed to serialize checkpoint: {}", e),
            suggestion: None,
        })?;

        fs::write(&path, json).map_err(|e| ConductorError::Io {
            message: format!("Failed to write checkpoint: {}", e),
            path: Some(path.clone()),
        })?;

        Ok(path)
    }

    /// Load a checkpoint from a specific path
    pub fn load(&self, path: &Path) -> Result<Checkpoint, ConductorError> {
        let json = fs::read_to_string(path).map_err(|e| ConductorError::Io {
            message: format!("Failed to read checkpoint: {}", e),
            path: Some(path.to_path_buf()),
        })?;

        serde_json::from_str(&json).map_err(|e| ConductorError::Checkpoint {
            message: format!("Failed to parse checkpoint: {}", e),
            suggestion: Some("The checkpoint file may be corrupted".to_string()),
        })
    }

    /// Load the checkpoint for a play, if one exists
    pub fn load_latest(&self, play_name: &str) -> Result<Option<Checkpoint>, ConductorError> {
        let path = self.checkpoint_path(play_name);

        if !path.exists() {
            return Ok(None);
        }

        self.load(&path).map(Some)
    }

    /// Delete the checkpoint for a play
    pub fn cleanup(&self, play_name: &str) -> Result<(), ConductorError> {
        let path = self.checkpoint_path(play_name);

        if path.exists() {
            fs::remove_file(&path).map_err(|e| ConductorError::Io {
                message: format!("Failed to delete checkpoint: {}", e),
                path: Some(path),
            })?;
        }

        Ok(())
    }
}

/// Content hash of the parts of a play that decide task indices and policy
pub fn play_hash(play: &Play) -> String {
    let mut content = String::new();
    for task in &play.tasks {
        content.push_str("task:");
        content.push_str(&task.name);
        content.push('\n');
    }
    for handler in &play.handlers {
        content.push_str("handler:");
        content.push_str(handler.name());
        content.push('\n');
    }
    // serializing the policy cannot fail: plain fields only
    content.push_str(&serde_json::to_string(&play.policy).unwrap_or_default());
    calculate_hash(&content)
}

/// Calculate SHA256 hash of a string
fn calculate_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
