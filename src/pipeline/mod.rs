//! Atomic multi-artifact commit pipeline.
//!
//! Rebuilds the index and score set, writes both with backups, then commits
//! the last-good pointer. A failed write or commit rolls the artifacts back
//! before the run ends.

pub mod fs_adapters;
pub mod publish;
pub mod snapshot;

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::engine::types::{Flow, RunOptions, RunResult, StateId};
use crate::engine::{SpecError, Specification, StateDef};
use crate::storage::pointer::LastGoodPointer;

pub const PIPELINE_NAME: &str = "index-pipeline";
pub const PIPELINE_VERSION: &str = "1.2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Start,
    DetectStorage,
    LoadLastGood,
    EnsureWritable,
    BuildIndex,
    Score,
    WriteAtomic,
    CommitPointer,
    Publish,
    Done,
    PartialWrite,
    CommitFailed,
    Rollback,
    BadConfig,
    NoVolume,
    ReadOnlyVolume,
    IndexFailed,
    ScoreFailed,
    RollbackFailed,
    PublishFailed,
}

impl StateId for PipelineState {
    fn name(self) -> &'static str {
        match self {
            PipelineState::Start => "Start",
            PipelineState::DetectStorage => "DetectStorage",
            PipelineState::LoadLastGood => "LoadLastGood",
            PipelineState::EnsureWritable => "EnsureWritable",
            PipelineState::BuildIndex => "BuildIndex",
            PipelineState::Score => "Score",
            PipelineState::WriteAtomic => "WriteAtomic",
            PipelineState::CommitPointer => "CommitPointer",
            PipelineState::Publish => "Publish",
            PipelineState::Done => "Done",
            PipelineState::PartialWrite => "PartialWrite",
            PipelineState::CommitFailed => "CommitFailed",
            PipelineState::Rollback => "Rollback",
            PipelineState::BadConfig => "BadConfig",
            PipelineState::NoVolume => "NoVolume",
            PipelineState::ReadOnlyVolume => "ReadOnlyVolume",
            PipelineState::IndexFailed => "IndexFailed",
            PipelineState::ScoreFailed => "ScoreFailed",
            PipelineState::RollbackFailed => "RollbackFailed",
            PipelineState::PublishFailed => "PublishFailed",
        }
    }
}

/// Whether a committed artifact set is pushed to a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    #[default]
    Local,
    Publish,
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishMode::Local => write!(f, "local"),
            PublishMode::Publish => write!(f, "publish"),
        }
    }
}

impl std::str::FromStr for PublishMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(PublishMode::Local),
            "publish" => Ok(PublishMode::Publish),
            _ => anyhow::bail!("Invalid mode '{}'. Use: local, publish", s),
        }
    }
}

/// Where the pipeline reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the storage volume; must exist before a run.
    pub data_dir: PathBuf,
    pub index_path: PathBuf,
    pub scores_path: PathBuf,
    pub pointer_path: PathBuf,
    pub mode: PublishMode,
}

impl PipelineConfig {
    /// Config with the default artifact layout under `data_dir`.
    pub fn under(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            index_path: data_dir.join("index.json"),
            scores_path: data_dir.join("scores.json"),
            pointer_path: data_dir.join("last_good.json"),
            data_dir,
            mode: PublishMode::Local,
        }
    }

    /// Problems that make a run pointless; empty when the config is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let named = [
            ("data_dir", &self.data_dir),
            ("index_path", &self.index_path),
            ("scores_path", &self.scores_path),
            ("pointer_path", &self.pointer_path),
        ];
        for (name, path) in named {
            if path.as_os_str().is_empty() {
                problems.push(format!("{} is required", name));
            }
        }
        if self.index_path == self.scores_path {
            problems.push("index_path and scores_path must differ".to_string());
        }
        if self.pointer_path == self.index_path || self.pointer_path == self.scores_path {
            problems.push("pointer_path must differ from the artifact paths".to_string());
        }
        problems
    }
}

/// Pipeline stage, used to attribute notes and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Config,
    Volume,
    LastGood,
    Index,
    Score,
    Write,
    Commit,
    Rollback,
    Publish,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageNote {
    pub stage: Stage,
    pub note: String,
}

/// Per-run context of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineCtx {
    pub config: PipelineConfig,
    pub has_volume: bool,
    pub can_write: bool,
    pub last_good: Option<LastGoodPointer>,
    #[serde(skip)]
    pub index_payload: Option<serde_json::Value>,
    pub index_count: usize,
    #[serde(skip)]
    pub scores_payload: Option<serde_json::Value>,
    pub scored_count: usize,
    pub written_paths: Vec<PathBuf>,
    pub index_backup: Option<PathBuf>,
    pub scores_backup: Option<PathBuf>,
    pub pointer: Option<LastGoodPointer>,
    pub rolled_back: Option<bool>,
    pub rollback_error: Option<String>,
    pub published: Option<bool>,
    /// First stage failure of the run, if any.
    pub failure: Option<StageNote>,
    pub notes: Vec<StageNote>,
}

impl PipelineCtx {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            has_volume: false,
            can_write: false,
            last_good: None,
            index_payload: None,
            index_count: 0,
            scores_payload: None,
            scored_count: 0,
            written_paths: Vec::new(),
            index_backup: None,
            scores_backup: None,
            pointer: None,
            rolled_back: None,
            rollback_error: None,
            published: None,
            failure: None,
            notes: Vec::new(),
        }
    }

    pub fn failed_at(&self, stage: Stage) -> bool {
        self.failure.as_ref().is_some_and(|f| f.stage == stage)
    }

    fn note(&mut self, stage: Stage, note: impl Into<String>) {
        let note = note.into();
        if !note.is_empty() {
            self.notes.push(StageNote { stage, note });
        }
    }

    fn fail(&mut self, stage: Stage, message: String) {
        warn!(stage = ?stage, error = %message, "Pipeline stage failed");
        self.notes.push(StageNote {
            stage,
            note: message.clone(),
        });
        if self.failure.is_none() {
            self.failure = Some(StageNote {
                stage,
                note: message,
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStatus {
    pub has_volume: bool,
    pub can_write: bool,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastGoodLoad {
    pub last_good: Option<LastGoodPointer>,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub index_payload: serde_json::Value,
    pub index_count: usize,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub scores_payload: serde_json::Value,
    pub scored_count: usize,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written_paths: Vec<PathBuf>,
    pub index_backup: Option<PathBuf>,
    pub scores_backup: Option<PathBuf>,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub pointer: LastGoodPointer,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub rolled_back: bool,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub published: bool,
    pub note: String,
}

/// Stage implementations the pipeline calls. An `Err` marks the stage failed.
#[async_trait]
pub trait PipelineAdapters: Send + Sync {
    async fn check_volume(&self, ctx: &PipelineCtx) -> Result<VolumeStatus>;

    async fn load_last_good(&self, ctx: &PipelineCtx) -> Result<LastGoodLoad>;

    async fn build_index(&self, ctx: &PipelineCtx) -> Result<BuildOutcome>;

    async fn score_index(&self, ctx: &PipelineCtx) -> Result<ScoreOutcome>;

    async fn write_atomic(&self, ctx: &PipelineCtx) -> Result<WriteOutcome>;

    async fn commit_last_good(&self, ctx: &PipelineCtx) -> Result<CommitOutcome>;

    async fn rollback(&self, ctx: &PipelineCtx) -> Result<RollbackOutcome>;

    /// Whether a publisher is configured.
    fn can_publish(&self) -> bool {
        false
    }

    async fn publish(&self, _ctx: &PipelineCtx) -> Result<PublishOutcome> {
        Ok(PublishOutcome {
            published: false,
            note: "no publisher configured".to_string(),
        })
    }
}

/// Adapter set as the pipeline specification sees it.
pub type Adapters = dyn PipelineAdapters;

pub type PipelineSpec = Specification<PipelineState, PipelineCtx, Adapters>;

type StepFuture<'a> = BoxFuture<'a, Result<Flow<PipelineState>>>;

fn enter_start<'a>(ctx: &'a mut PipelineCtx, _adapters: &'a Adapters) -> StepFuture<'a> {
    Box::pin(async move {
        let problems = ctx.config.problems();
        if !problems.is_empty() {
            ctx.fail(Stage::Config, problems.join("; "));
        }
        Ok(Flow::Continue)
    })
}

fn enter_detect_storage<'a>(ctx: &'a mut PipelineCtx, adapters: &'a Adapters) -> StepFuture<'a> {
    Box::pin(async move {
        match adapters.check_volume(ctx).await {
            Ok(status) => {
                ctx.has_volume = status.has_volume;
                ctx.can_write = status.can_write;
                ctx.note(Stage::Volume, status.note);
            }
            Err(e) => {
                ctx.has_volume = false;
                ctx.can_write = false;
                ctx.fail(Stage::Volume, format!("{:#}", e));
            }
        }
        Ok(Flow::Continue)
    })
}

// A pointer that cannot be read is not a named failure; let it surface as ActionError.
fn enter_load_last_good<'a>(ctx: &'a mut PipelineCtx, adapters: &'a Adapters) -> StepFuture<'a> {
    Box::pin(async move {
        let loaded = adapters.load_last_good(ctx).await?;
        ctx.last_good = loaded.last_good;
        ctx.note(Stage::LastGood, loaded.note);
        Ok(Flow::Continue)
    })
}

fn enter_build_index<'a>(ctx: &'a mut PipelineCtx, adapters: &'a Adapters) -> StepFuture<'a> {
    Box::pin(async move {
        match adapters.build_index(ctx).await {
            Ok(out) => {
                ctx.index_payload = Some(out.index_payload);
                ctx.index_count = out.index_count;
                ctx.note(Stage::Index, out.note);
            }
            Err(e) => ctx.fail(Stage::Index, format!("{:#}", e)),
        }
        Ok(Flow::Continue)
    })
}

fn enter_score<'a>(ctx: &'a mut PipelineCtx, adapters: &'a Adapters) -> StepFuture<'a> {
    Box::pin(async move {
        match adapters.score_index(ctx).await {
            Ok(out) => {
                ctx.scores_payload = Some(out.scores_payload);
                ctx.scored_count = out.scored_count;
                ctx.note(Stage::Score, out.note);
            }
            Err(e) => ctx.fail(Stage::Score, format!("{:#}", e)),
        }
        Ok(Flow::Continue)
    })
}

fn enter_write_atomic<'a>(ctx: &'a mut PipelineCtx, adapters: &'a Adapters) -> StepFuture<'a> {
    Box::pin(async move {
        match adapters.write_atomic(ctx).await {
            Ok(out) => {
                ctx.written_paths = out.written_paths;
                ctx.index_backup = out.index_backup;
                ctx.scores_backup = out.scores_backup;
                ctx.note(Stage::Write, out.note);
            }
            Err(e) => ctx.fail(Stage::Write, format!("{:#}", e)),
        }
        Ok(Flow::Continue)
    })
}

fn enter_commit_pointer<'a>(ctx: &'a mut PipelineCtx, adapters: &'a Adapters) -> StepFuture<'a> {
    Box::pin(async move {
        match adapters.commit_last_good(ctx).await {
            Ok(out) => {
                ctx.pointer = Some(out.pointer);
                ctx.note(Stage::Commit, out.note);
            }
            Err(e) => ctx.fail(Stage::Commit, format!("{:#}", e)),
        }
        Ok(Flow::Continue)
    })
}

fn enter_rollback<'a>(ctx: &'a mut PipelineCtx, adapters: &'a Adapters) -> StepFuture<'a> {
    Box::pin(async move {
        match adapters.rollback(ctx).await {
            Ok(out) => {
                info!(rolled_back = out.rolled_back, note = %out.note, "Rollback finished");
                ctx.rolled_back = Some(out.rolled_back);
                ctx.note(Stage::Rollback, out.note);
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(error = %message, "Rollback failed; manual recovery required");
                ctx.rolled_back = Some(false);
                ctx.note(Stage::Rollback, message.clone());
                ctx.rollback_error = Some(message);
            }
        }
        Ok(Flow::Continue)
    })
}

fn enter_publish<'a>(ctx: &'a mut PipelineCtx, adapters: &'a Adapters) -> StepFuture<'a> {
    Box::pin(async move {
        if ctx.config.mode == PublishMode::Local || !adapters.can_publish() {
            ctx.published = Some(false);
            ctx.note(Stage::Publish, format!("publish skipped ({} mode)", ctx.config.mode));
            return Ok(Flow::Continue);
        }
        match adapters.publish(ctx).await {
            Ok(out) => {
                ctx.published = Some(out.published);
                ctx.note(Stage::Publish, out.note);
            }
            Err(e) => {
                ctx.published = Some(false);
                ctx.fail(Stage::Publish, format!("{:#}", e));
            }
        }
        Ok(Flow::Continue)
    })
}

/// Build the pipeline specification.
pub fn specification() -> Result<PipelineSpec, SpecError> {
    use PipelineState::*;

    Specification::builder(PIPELINE_NAME, PIPELINE_VERSION, Start)
        .state(Start, StateDef::new().on_enter(enter_start))
        .state(DetectStorage, StateDef::new().on_enter(enter_detect_storage))
        .state(LoadLastGood, StateDef::new().on_enter(enter_load_last_good))
        .plain(EnsureWritable)
        .state(BuildIndex, StateDef::new().on_enter(enter_build_index))
        .state(Score, StateDef::new().on_enter(enter_score))
        .state(WriteAtomic, StateDef::new().on_enter(enter_write_atomic))
        .state(CommitPointer, StateDef::new().on_enter(enter_commit_pointer))
        .state(Publish, StateDef::new().on_enter(enter_publish))
        .plain(PartialWrite)
        .plain(CommitFailed)
        .state(Rollback, StateDef::new().on_enter(enter_rollback))
        .terminal(Done)
        .fail(BadConfig)
        .fail(NoVolume)
        .fail(ReadOnlyVolume)
        .fail(IndexFailed)
        .fail(ScoreFailed)
        .fail(RollbackFailed)
        .fail(PublishFailed)
        .guarded(Start, BadConfig, "config invalid", |c| c.failed_at(Stage::Config))
        .transition(Start, DetectStorage, "config ok")
        .guarded(DetectStorage, NoVolume, "no volume", |c| !c.has_volume)
        .transition(DetectStorage, LoadLastGood, "volume present")
        .transition(LoadLastGood, EnsureWritable, "pointer loaded")
        .guarded(EnsureWritable, ReadOnlyVolume, "read-only", |c| !c.can_write)
        .transition(EnsureWritable, BuildIndex, "writable")
        .guarded(BuildIndex, IndexFailed, "build failed", |c| c.failed_at(Stage::Index))
        .transition(BuildIndex, Score, "index built")
        .guarded(Score, ScoreFailed, "score failed", |c| c.failed_at(Stage::Score))
        .transition(Score, WriteAtomic, "scored")
        .guarded(WriteAtomic, PartialWrite, "write failed", |c| c.failed_at(Stage::Write))
        .transition(WriteAtomic, CommitPointer, "written")
        .guarded(CommitPointer, CommitFailed, "commit failed", |c| c.failed_at(Stage::Commit))
        .transition(CommitPointer, Publish, "committed")
        .transition(PartialWrite, Rollback, "roll back partial write")
        .transition(CommitFailed, Rollback, "roll back uncommitted write")
        .guarded(Rollback, RollbackFailed, "rollback raised", |c| c.rollback_error.is_some())
        .transition(Rollback, Done, "rollback finished")
        .guarded(Publish, PublishFailed, "publish failed", |c| c.failed_at(Stage::Publish))
        .transition(Publish, Done, "published")
        .success_when(|c| c.failure.is_none())
        .build()
}

/// The commit pipeline, ready to run against any adapter set.
pub struct Pipeline {
    spec: PipelineSpec,
    options: RunOptions<PipelineState>,
}

impl Pipeline {
    pub fn new() -> Result<Self, SpecError> {
        Ok(Self {
            spec: specification()?,
            options: RunOptions::default(),
        })
    }

    pub fn with_options(mut self, options: RunOptions<PipelineState>) -> Self {
        self.options = options;
        self
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub async fn execute(
        &self,
        config: PipelineConfig,
        adapters: &Adapters,
    ) -> RunResult<PipelineState, PipelineCtx> {
        crate::engine::run(&self.spec, PipelineCtx::new(config), adapters, &self.options).await
    }
}
