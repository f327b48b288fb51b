use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::pipeline::*;
use crate::storage::atomic::{
    backup_file, probe_writable, prune_backups, remove_if_exists, restore_file, sha256_file,
    write_json_atomic,
};
use crate::storage::pointer::{LastGoodPointer, commit_pointer, load_pointer};

/// Produces the index and score payloads. Stands in for the domain-specific
/// indexer and scoring formula.
#[async_trait]
pub trait IndexSource: Send + Sync {
    async fn build(&self, ctx: &PipelineCtx) -> Result<BuildOutcome>;

    async fn score(&self, ctx: &PipelineCtx) -> Result<ScoreOutcome>;
}

/// Pushes a committed pointer to downstream consumers.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns a human-readable note on success.
    async fn publish(&self, pointer: &LastGoodPointer) -> Result<String>;
}

/// One artifact touched by `write_atomic`.
#[derive(Debug, Clone)]
struct JournalEntry {
    target: PathBuf,
    backup: Option<PathBuf>,
    written: bool,
}

/// Adapter set backed by the local filesystem.
///
/// Journals the backups and writes of the current run so `rollback` can undo
/// them even when `write_atomic` failed halfway. The journal is reset when a
/// write starts and cleared once the pointer is committed, so one instance can
/// serve consecutive runs.
pub struct FsAdapters {
    source: Arc<dyn IndexSource>,
    publisher: Option<Arc<dyn Publisher>>,
    journal: Mutex<Vec<JournalEntry>>,
}

impl FsAdapters {
    pub fn new(source: Arc<dyn IndexSource>) -> Self {
        Self {
            source,
            publisher: None,
            journal: Mutex::new(Vec::new()),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    fn journal(&self) -> MutexGuard<'_, Vec<JournalEntry>> {
        self.journal.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PipelineAdapters for FsAdapters {
    async fn check_volume(&self, ctx: &PipelineCtx) -> Result<VolumeStatus> {
        let dir = &ctx.config.data_dir;
        let is_dir = tokio::fs::metadata(dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Ok(VolumeStatus {
                has_volume: false,
                can_write: false,
                note: format!("{} is not a mounted directory", dir.display()),
            });
        }

        let can_write = probe_writable(dir).await;
        Ok(VolumeStatus {
            has_volume: true,
            can_write,
            note: if can_write {
                format!("{} is writable", dir.display())
            } else {
                format!("{} is read-only", dir.display())
            },
        })
    }

    async fn load_last_good(&self, ctx: &PipelineCtx) -> Result<LastGoodLoad> {
        let last_good = load_pointer(&ctx.config.pointer_path).await?;
        let note = match &last_good {
            Some(p) => format!("last good committed at {}", p.updated_at.to_rfc3339()),
            None => "no last-good pointer yet".to_string(),
        };
        Ok(LastGoodLoad { last_good, note })
    }

    async fn build_index(&self, ctx: &PipelineCtx) -> Result<BuildOutcome> {
        self.source.build(ctx).await
    }

    async fn score_index(&self, ctx: &PipelineCtx) -> Result<ScoreOutcome> {
        self.source.score(ctx).await
    }

    async fn write_atomic(&self, ctx: &PipelineCtx) -> Result<WriteOutcome> {
        let index = ctx
            .index_payload
            .as_ref()
            .context("No index payload to write")?;
        let scores = ctx
            .scores_payload
            .as_ref()
            .context("No scores payload to write")?;

        self.journal().clear();

        let stamp = Utc::now();
        let mut backups = Vec::with_capacity(2);
        let mut written_paths = Vec::with_capacity(2);

        for (target, payload) in [
            (&ctx.config.index_path, index),
            (&ctx.config.scores_path, scores),
        ] {
            // Journal before any mutation so rollback sees every backup taken.
            let backup = backup_file(target, stamp).await?;
            let slot = {
                let mut journal = self.journal();
                journal.push(JournalEntry {
                    target: target.clone(),
                    backup: backup.clone(),
                    written: false,
                });
                journal.len() - 1
            };

            write_json_atomic(target, payload).await?;
            self.journal()[slot].written = true;
            written_paths.push(target.clone());
            backups.push(backup);
        }

        let scores_backup = backups.pop().flatten();
        let index_backup = backups.pop().flatten();
        let note = format!(
            "wrote {} artifact(s), {} backup(s)",
            written_paths.len(),
            [&index_backup, &scores_backup]
                .iter()
                .filter(|b| b.is_some())
                .count()
        );

        Ok(WriteOutcome {
            written_paths,
            index_backup,
            scores_backup,
            note,
        })
    }

    async fn commit_last_good(&self, ctx: &PipelineCtx) -> Result<CommitOutcome> {
        let config = &ctx.config;
        let pointer = LastGoodPointer {
            updated_at: Utc::now(),
            index_path: config.index_path.clone(),
            scores_path: config.scores_path.clone(),
            index_backup_path: ctx.index_backup.clone(),
            scores_backup_path: ctx.scores_backup.clone(),
            index_sha256: Some(sha256_file(&config.index_path).await?),
            scores_sha256: Some(sha256_file(&config.scores_path).await?),
        };
        commit_pointer(&config.pointer_path, &pointer).await?;
        self.journal().clear();

        for (target, keep) in [
            (&pointer.index_path, &pointer.index_backup_path),
            (&pointer.scores_path, &pointer.scores_backup_path),
        ] {
            let keep: Vec<&std::path::Path> = keep.iter().map(|p| p.as_path()).collect();
            match prune_backups(target, &keep).await {
                Ok(0) => {}
                Ok(n) => info!(target = %target.display(), removed = n, "Pruned stale backups"),
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(target = %target.display(), error = %message, "Backup pruning failed");
                }
            }
        }

        Ok(CommitOutcome {
            note: format!("pointer committed to {}", config.pointer_path.display()),
            pointer,
        })
    }

    async fn rollback(&self, _ctx: &PipelineCtx) -> Result<RollbackOutcome> {
        let entries: Vec<JournalEntry> = self.journal().drain(..).rev().collect();
        if entries.is_empty() {
            return Ok(RollbackOutcome {
                rolled_back: false,
                note: "nothing was written; nothing to roll back".to_string(),
            });
        }

        let mut restored = 0;
        let mut notes = Vec::new();
        let mut failures = Vec::new();
        for entry in entries {
            let target = entry.target.display();
            match &entry.backup {
                Some(backup) => match restore_file(backup, &entry.target).await {
                    Ok(()) => {
                        info!(target = %target, backup = %backup.display(), "Artifact restored");
                        restored += 1;
                        notes.push(format!("restored {}", target));
                    }
                    Err(e) => {
                        let message = format!("{}: {:#}", target, e);
                        error!(error = %message, "Artifact restore failed");
                        failures.push(message);
                    }
                },
                None if entry.written => match remove_if_exists(&entry.target).await {
                    Ok(_) => {
                        warn!(target = %target, "No backup; removed artifact created by this run");
                        notes.push(format!("no backup for {}; left absent", target));
                    }
                    Err(e) => {
                        let message = format!("{}: {:#}", target, e);
                        error!(error = %message, "Artifact removal failed");
                        failures.push(message);
                    }
                },
                None => notes.push(format!("no backup for {}; left absent", target)),
            }
        }

        if !failures.is_empty() {
            let done = if notes.is_empty() {
                String::new()
            } else {
                format!(" ({})", notes.join("; "))
            };
            bail!(
                "Rollback incomplete, {} artifact(s) not restored: {}{}",
                failures.len(),
                failures.join("; "),
                done
            );
        }

        Ok(RollbackOutcome {
            rolled_back: restored > 0,
            note: notes.join("; "),
        })
    }

    fn can_publish(&self) -> bool {
        self.publisher.is_some()
    }

    async fn publish(&self, ctx: &PipelineCtx) -> Result<PublishOutcome> {
        let Some(publisher) = &self.publisher else {
            return Ok(PublishOutcome {
                published: false,
                note: "no publisher configured".to_string(),
            });
        };
        let Some(pointer) = &ctx.pointer else {
            bail!("Nothing committed to publish");
        };
        let note = publisher.publish(pointer).await?;
        Ok(PublishOutcome {
            published: true,
            note,
        })
    }
}
