//! Run-facing types: phases, plan rows, progress samples, advisories, and
//! the event stream collaborators subscribe to.

use serde::Serialize;

use crate::item::ItemId;

/// The workflow phase. Exactly one value at any instant, process-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Checking,
    AwaitingConfirm,
    Syncing,
}

/// One live progress reading during the real transfer. Each sample fully
/// supersedes the previous one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSample {
    pub fraction: f64,
    pub percent_text: String,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub transferred_files: u64,
    pub total_files: u64,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: Option<u64>,
}

/// Planned work for one item, recorded when its dry-run scan completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanRow {
    pub item_id: ItemId,
    pub source_shown: String,
    pub dest_shown: String,
    pub files: u64,
    pub bytes: u64,
}

/// One-shot advisories raised at most once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advisory {
    /// Discovered scope crossed the large-dataset thresholds; planning can
    /// be abandoned in favor of syncing immediately.
    LargePlan,
    /// Failure symptoms resemble an OS-level access restriction rather than
    /// a generic transfer error.
    PermissionHint,
}

/// How one item's transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    Failed,
    Cancelled,
}

/// Events pushed to collaborators over an unbounded channel. The UI renders
/// these; it never reaches into run internals.
#[derive(Debug, Clone)]
pub enum RunEvent {
    PhaseChanged(RunPhase),
    /// Live global discovery counters during scanning (sums across items).
    Discovery { files: u64, bytes: u64 },
    /// The complete ordered plan, ready for confirmation.
    PlanReady {
        rows: Vec<PlanRow>,
        total_files: u64,
        total_bytes: u64,
    },
    ItemStarted {
        item_id: ItemId,
        source_shown: String,
        dest_shown: String,
    },
    Progress {
        item_id: ItemId,
        sample: ProgressSample,
    },
    ItemFinished {
        item_id: ItemId,
        outcome: ItemOutcome,
        message: String,
    },
    Advisory { kind: Advisory, text: String },
    RunFinished { cancelled: bool },
}
