//! Integration tests for the commit pipeline over the filesystem adapters.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;

use commitflow::engine::types::{EndState, EngineFail};
use commitflow::pipeline::fs_adapters::{FsAdapters, IndexSource, Publisher};
use commitflow::pipeline::snapshot::SnapshotSource;
use commitflow::pipeline::*;
use commitflow::storage::pointer::{LastGoodPointer, load_pointer};

// --- Test doubles ---

struct FixedSource {
    ids: Vec<&'static str>,
    fail_score: bool,
}

impl FixedSource {
    fn new(ids: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            ids: ids.to_vec(),
            fail_score: false,
        })
    }

    fn failing_score() -> Arc<Self> {
        Arc::new(Self {
            ids: vec!["a"],
            fail_score: true,
        })
    }
}

#[async_trait]
impl IndexSource for FixedSource {
    async fn build(&self, _ctx: &PipelineCtx) -> Result<BuildOutcome> {
        let entries: Vec<_> = self.ids.iter().map(|id| json!({ "id": id })).collect();
        Ok(BuildOutcome {
            index_payload: json!({ "entries": entries, "count": self.ids.len() }),
            index_count: self.ids.len(),
            note: "fixed".to_string(),
        })
    }

    async fn score(&self, _ctx: &PipelineCtx) -> Result<ScoreOutcome> {
        if self.fail_score {
            bail!("scoring model unavailable");
        }
        let scores: serde_json::Map<_, _> =
            self.ids.iter().map(|id| (id.to_string(), json!(50))).collect();
        Ok(ScoreOutcome {
            scores_payload: serde_json::Value::Object(scores),
            scored_count: self.ids.len(),
            note: "fixed".to_string(),
        })
    }
}

#[derive(Default)]
struct RecordingPublisher {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, _pointer: &LastGoodPointer) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("webhook returned 503");
        }
        Ok("published".to_string())
    }
}

/// Wraps the filesystem adapters and injects failures at chosen stages.
#[derive(Default, Clone, Copy)]
struct Faults {
    volume: Option<(bool, bool)>,
    commit: bool,
    rollback: bool,
    /// Delete the scores backup just before rollback runs.
    lose_scores_backup: bool,
}

struct Faulty {
    inner: FsAdapters,
    faults: Faults,
    volume_checks: AtomicUsize,
    commit_broken: AtomicBool,
}

impl Faulty {
    fn new(inner: FsAdapters, faults: Faults) -> Self {
        Self {
            inner,
            faults,
            volume_checks: AtomicUsize::new(0),
            commit_broken: AtomicBool::new(faults.commit),
        }
    }

    fn break_commit(&self) {
        self.commit_broken.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PipelineAdapters for Faulty {
    async fn check_volume(&self, ctx: &PipelineCtx) -> Result<VolumeStatus> {
        self.volume_checks.fetch_add(1, Ordering::SeqCst);
        if let Some((has_volume, can_write)) = self.faults.volume {
            return Ok(VolumeStatus {
                has_volume,
                can_write,
                note: "injected".to_string(),
            });
        }
        self.inner.check_volume(ctx).await
    }

    async fn load_last_good(&self, ctx: &PipelineCtx) -> Result<LastGoodLoad> {
        self.inner.load_last_good(ctx).await
    }

    async fn build_index(&self, ctx: &PipelineCtx) -> Result<BuildOutcome> {
        self.inner.build_index(ctx).await
    }

    async fn score_index(&self, ctx: &PipelineCtx) -> Result<ScoreOutcome> {
        self.inner.score_index(ctx).await
    }

    async fn write_atomic(&self, ctx: &PipelineCtx) -> Result<WriteOutcome> {
        self.inner.write_atomic(ctx).await
    }

    async fn commit_last_good(&self, ctx: &PipelineCtx) -> Result<CommitOutcome> {
        if self.commit_broken.load(Ordering::SeqCst) {
            bail!("pointer volume went away");
        }
        self.inner.commit_last_good(ctx).await
    }

    async fn rollback(&self, ctx: &PipelineCtx) -> Result<RollbackOutcome> {
        if self.faults.rollback {
            bail!("backup unreadable");
        }
        if self.faults.lose_scores_backup {
            if let Some(backup) = &ctx.scores_backup {
                std::fs::remove_file(backup)?;
            }
        }
        self.inner.rollback(ctx).await
    }

    fn can_publish(&self) -> bool {
        self.inner.can_publish()
    }

    async fn publish(&self, ctx: &PipelineCtx) -> Result<PublishOutcome> {
        self.inner.publish(ctx).await
    }
}

fn pipeline() -> Pipeline {
    Pipeline::new().unwrap()
}

fn seed_artifacts(dir: &Path) -> (Vec<u8>, Vec<u8>) {
    let index = b"{\n  \"entries\": [\"old\"]\n}\n".to_vec();
    let scores = b"{\n  \"old\": 99\n}\n".to_vec();
    std::fs::write(dir.join("index.json"), &index).unwrap();
    std::fs::write(dir.join("scores.json"), &scores).unwrap();
    (index, scores)
}

fn backup_names(dir: &Path) -> Vec<String> {
    file_names(dir)
        .into_iter()
        .filter(|n| n.ends_with(".bak"))
        .collect()
}

fn file_name_of(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().to_string()
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

// --- Happy paths ---

#[tokio::test]
async fn empty_index_still_commits() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("snapshot.json");
    std::fs::write(&snapshot, b"[]").unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();

    let adapters = FsAdapters::new(Arc::new(SnapshotSource::new(&snapshot)));
    let result = pipeline()
        .execute(PipelineConfig::under(&data), &adapters)
        .await;

    assert!(result.ok, "note: {:?}", result.note);
    assert!(result.ended_in(PipelineState::Done));
    assert_eq!(result.ctx.index_count, 0);
    assert_eq!(
        result.path(),
        vec![
            "Start",
            "DetectStorage",
            "LoadLastGood",
            "EnsureWritable",
            "BuildIndex",
            "Score",
            "WriteAtomic",
            "CommitPointer",
            "Publish",
        ]
    );

    let pointer = load_pointer(&data.join("last_good.json"))
        .await
        .unwrap()
        .unwrap();
    assert!(pointer.verify().await.is_empty());
    assert!(pointer.index_backup_path.is_none());
}

#[tokio::test]
async fn snapshot_entries_are_indexed_and_scored() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("snapshot.json");
    std::fs::write(
        &snapshot,
        json!([
            { "id": "alpha", "score": 150 },
            { "id": "beta", "score": 42.5 },
            { "id": "gamma" }
        ])
        .to_string(),
    )
    .unwrap();

    let adapters = FsAdapters::new(Arc::new(SnapshotSource::new(&snapshot)));
    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(result.ok);
    assert_eq!(result.ctx.index_count, 3);
    assert_eq!(result.ctx.scored_count, 3);

    let scores: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("scores.json")).unwrap())
            .unwrap();
    assert_eq!(scores["alpha"], 100.0);
    assert_eq!(scores["beta"], 42.5);
    assert_eq!(scores["gamma"], 0.0);
}

#[tokio::test]
async fn second_run_backs_up_previous_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (old_index, _) = seed_artifacts(dir.path());

    let adapters = FsAdapters::new(FixedSource::new(&["a", "b"]));
    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(result.ok);
    let pointer = result.ctx.pointer.clone().unwrap();
    let backup = pointer.index_backup_path.clone().unwrap();
    assert_eq!(std::fs::read(&backup).unwrap(), old_index);
    assert!(pointer.scores_backup_path.is_some());
    assert_eq!(
        load_pointer(&dir.path().join("last_good.json"))
            .await
            .unwrap()
            .unwrap(),
        pointer
    );
}

// --- Storage detection ---

#[tokio::test]
async fn missing_volume_ends_in_no_volume_without_writes() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("not-mounted");

    let adapters = FsAdapters::new(FixedSource::new(&["a"]));
    let result = pipeline()
        .execute(PipelineConfig::under(&data), &adapters)
        .await;

    assert!(!result.ok);
    assert!(result.ended_in(PipelineState::NoVolume));
    assert!(!data.exists());
    assert!(file_names(dir.path()).is_empty());
}

#[tokio::test]
async fn reported_missing_volume_performs_zero_writes() {
    let dir = tempfile::tempdir().unwrap();
    let adapters = Faulty::new(
        FsAdapters::new(FixedSource::new(&["a"])),
        Faults {
            volume: Some((false, false)),
            ..Default::default()
        },
    );

    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(result.ended_in(PipelineState::NoVolume));
    assert_eq!(adapters.volume_checks.load(Ordering::SeqCst), 1);
    assert!(file_names(dir.path()).is_empty());
}

#[tokio::test]
async fn read_only_volume_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let adapters = Faulty::new(
        FsAdapters::new(FixedSource::new(&["a"])),
        Faults {
            volume: Some((true, false)),
            ..Default::default()
        },
    );

    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(!result.ok);
    assert!(result.ended_in(PipelineState::ReadOnlyVolume));
    assert!(file_names(dir.path()).is_empty());
}

#[tokio::test]
async fn unusable_config_is_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::under(dir.path());
    config.scores_path = config.index_path.clone();

    let adapters = FsAdapters::new(FixedSource::new(&["a"]));
    let result = pipeline().execute(config, &adapters).await;

    assert!(result.ended_in(PipelineState::BadConfig));
    assert!(result.ctx.failed_at(Stage::Config));
    assert_eq!(result.steps, 1);
}

#[tokio::test]
async fn corrupt_pointer_is_an_action_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("last_good.json"), b"{ truncated").unwrap();

    let adapters = FsAdapters::new(FixedSource::new(&["a"]));
    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert_eq!(result.end, EndState::Engine(EngineFail::ActionError));
    assert!(!dir.path().join("index.json").exists());
}

// --- Build and score failures ---

#[tokio::test]
async fn unreadable_snapshot_is_index_failed() {
    let dir = tempfile::tempdir().unwrap();
    let (old_index, _) = seed_artifacts(dir.path());

    let adapters = FsAdapters::new(Arc::new(SnapshotSource::new(dir.path().join("absent.json"))));
    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(result.ended_in(PipelineState::IndexFailed));
    assert!(result.ctx.failed_at(Stage::Index));
    assert_eq!(std::fs::read(dir.path().join("index.json")).unwrap(), old_index);
}

#[tokio::test]
async fn snapshot_entry_without_id_is_index_failed() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("snapshot.json");
    std::fs::write(&snapshot, br#"[{"id":"a"},{"name":"no id"}]"#).unwrap();

    let adapters = FsAdapters::new(Arc::new(SnapshotSource::new(&snapshot)));
    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(result.ended_in(PipelineState::IndexFailed));
}

#[tokio::test]
async fn scoring_error_is_score_failed() {
    let dir = tempfile::tempdir().unwrap();
    let adapters = FsAdapters::new(FixedSource::failing_score());

    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(result.ended_in(PipelineState::ScoreFailed));
    assert!(!dir.path().join("index.json").exists());
}

// --- Rollback ---

#[tokio::test]
async fn failed_commit_restores_previous_artifacts_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let (old_index, old_scores) = seed_artifacts(dir.path());

    let adapters = Faulty::new(
        FsAdapters::new(FixedSource::new(&["new1", "new2"])),
        Faults {
            commit: true,
            ..Default::default()
        },
    );
    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(result.ended_in(PipelineState::Done));
    assert!(!result.ok);
    assert!(result.ctx.failed_at(Stage::Commit));
    assert_eq!(result.ctx.rolled_back, Some(true));
    assert!(result.path().contains(&"CommitFailed"));
    assert!(result.path().contains(&"Rollback"));

    assert_eq!(std::fs::read(dir.path().join("index.json")).unwrap(), old_index);
    assert_eq!(std::fs::read(dir.path().join("scores.json")).unwrap(), old_scores);
    assert!(!dir.path().join("last_good.json").exists());
}

#[tokio::test]
async fn rollback_restores_what_it_can_when_one_backup_is_lost() {
    let dir = tempfile::tempdir().unwrap();
    let (old_index, _) = seed_artifacts(dir.path());

    let adapters = Faulty::new(
        FsAdapters::new(FixedSource::new(&["new"])),
        Faults {
            commit: true,
            lose_scores_backup: true,
            ..Default::default()
        },
    );
    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(!result.ok);
    assert!(result.ended_in(PipelineState::RollbackFailed));
    let message = result.ctx.rollback_error.clone().unwrap();
    assert!(message.contains("scores.json"), "{}", message);
    assert!(message.contains("restored"), "{}", message);
    assert_eq!(std::fs::read(dir.path().join("index.json")).unwrap(), old_index);
}

#[tokio::test]
async fn reused_adapters_roll_back_to_the_previous_run_only() {
    let dir = tempfile::tempdir().unwrap();
    seed_artifacts(dir.path());
    let adapters = Faulty::new(
        FsAdapters::new(FixedSource::new(&["run1"])),
        Faults::default(),
    );

    let first = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;
    assert!(first.ok);
    let committed_index = std::fs::read(dir.path().join("index.json")).unwrap();
    let committed_scores = std::fs::read(dir.path().join("scores.json")).unwrap();

    adapters.break_commit();
    let second = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(second.ended_in(PipelineState::Done));
    assert!(!second.ok);
    assert_eq!(second.ctx.rolled_back, Some(true));
    assert_eq!(std::fs::read(dir.path().join("index.json")).unwrap(), committed_index);
    assert_eq!(std::fs::read(dir.path().join("scores.json")).unwrap(), committed_scores);

    let rollback_note = second
        .ctx
        .notes
        .iter()
        .find(|n| n.stage == Stage::Rollback)
        .unwrap();
    assert_eq!(rollback_note.note.matches("restored ").count(), 2);
}

#[tokio::test]
async fn failed_first_commit_leaves_no_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let adapters = Faulty::new(
        FsAdapters::new(FixedSource::new(&["a"])),
        Faults {
            commit: true,
            ..Default::default()
        },
    );

    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(result.ended_in(PipelineState::Done));
    assert!(!result.ok);
    assert_eq!(result.ctx.rolled_back, Some(false));
    assert!(
        result
            .ctx
            .notes
            .iter()
            .any(|n| n.stage == Stage::Rollback && n.note.contains("left absent"))
    );
    assert!(file_names(dir.path()).is_empty());
}

#[tokio::test]
async fn partial_write_rolls_back_the_written_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let (old_index, _) = seed_artifacts(dir.path());
    // A plain file where the scores directory should be makes the second write fail.
    std::fs::write(dir.path().join("blocker"), b"").unwrap();
    let mut config = PipelineConfig::under(dir.path());
    config.scores_path = dir.path().join("blocker").join("scores.json");

    let adapters = FsAdapters::new(FixedSource::new(&["a"]));
    let result = pipeline().execute(config, &adapters).await;

    assert!(result.path().contains(&"PartialWrite"));
    assert!(result.ended_in(PipelineState::Done));
    assert!(!result.ok);
    assert!(result.ctx.failed_at(Stage::Write));
    assert_eq!(result.ctx.rolled_back, Some(true));
    assert_eq!(std::fs::read(dir.path().join("index.json")).unwrap(), old_index);
    assert!(!dir.path().join("last_good.json").exists());
}

#[tokio::test]
async fn rollback_error_is_rollback_failed() {
    let dir = tempfile::tempdir().unwrap();
    seed_artifacts(dir.path());
    let adapters = Faulty::new(
        FsAdapters::new(FixedSource::new(&["a"])),
        Faults {
            commit: true,
            rollback: true,
            ..Default::default()
        },
    );

    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(!result.ok);
    assert!(result.ended_in(PipelineState::RollbackFailed));
    assert_eq!(result.ctx.rollback_error.as_deref(), Some("backup unreadable"));
}

#[tokio::test]
async fn successful_commit_prunes_unreferenced_backups() {
    let dir = tempfile::tempdir().unwrap();
    seed_artifacts(dir.path());
    let adapters = FsAdapters::new(FixedSource::new(&["a"]));

    for _ in 0..3 {
        let result = pipeline()
            .execute(PipelineConfig::under(dir.path()), &adapters)
            .await;
        assert!(result.ok);
    }

    let pointer = load_pointer(&dir.path().join("last_good.json"))
        .await
        .unwrap()
        .unwrap();
    let mut expected = vec![
        file_name_of(pointer.index_backup_path.as_ref().unwrap()),
        file_name_of(pointer.scores_backup_path.as_ref().unwrap()),
    ];
    expected.sort();
    assert_eq!(backup_names(dir.path()), expected);
}

// --- Publishing ---

#[tokio::test]
async fn local_mode_never_publishes() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let adapters =
        FsAdapters::new(FixedSource::new(&["a"])).with_publisher(publisher.clone());

    let result = pipeline()
        .execute(PipelineConfig::under(dir.path()), &adapters)
        .await;

    assert!(result.ok);
    assert_eq!(result.ctx.published, Some(false));
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn publish_mode_notifies_publisher_after_commit() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let adapters =
        FsAdapters::new(FixedSource::new(&["a"])).with_publisher(publisher.clone());
    let mut config = PipelineConfig::under(dir.path());
    config.mode = PublishMode::Publish;

    let result = pipeline().execute(config, &adapters).await;

    assert!(result.ok);
    assert_eq!(result.ctx.published, Some(true));
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn publisher_error_is_publish_failed_with_commit_kept() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher {
        fail: true,
        ..Default::default()
    });
    let adapters = FsAdapters::new(FixedSource::new(&["a"])).with_publisher(publisher);
    let mut config = PipelineConfig::under(dir.path());
    config.mode = PublishMode::Publish;

    let result = pipeline().execute(config, &adapters).await;

    assert!(!result.ok);
    assert!(result.ended_in(PipelineState::PublishFailed));
    assert!(dir.path().join("last_good.json").exists());
}

// --- Specification ---

#[test]
fn pipeline_specification_builds() {
    let pipeline = pipeline();
    let spec = pipeline.spec();
    assert_eq!(spec.name(), PIPELINE_NAME);
    assert!(spec.is_terminal(PipelineState::Done));
    assert!(spec.is_fail(PipelineState::NoVolume));
    assert!(!spec.is_fail(PipelineState::PartialWrite));
}

#[test]
fn publish_mode_parses() {
    assert_eq!("publish".parse::<PublishMode>().unwrap(), PublishMode::Publish);
    assert_eq!("local".parse::<PublishMode>().unwrap(), PublishMode::Local);
    assert!("remote".parse::<PublishMode>().is_err());
}
