//! The run state machine: plan, confirm, sync.
//!
//! One orchestrator instance drives the whole workflow. Collaborators watch
//! the event stream (or poll the accessors) and feed back exactly three
//! signals: confirm/decline, stop, and the skip-plan escape hatch. All
//! external-process supervision stays behind this module and the modules it
//! drives; raw process handles never leak out.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{eyre, Result};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::debug_log::DebugLog;
use crate::events::{Advisory, ItemOutcome, PlanRow, ProgressSample, RunEvent, RunPhase};
use crate::invocation;
use crate::item::{ItemId, ItemPair, RunSnapshot};
use crate::parser::{parse_percent_only, parse_progress_line, LineBuffer, ProgressUpdate};
use crate::runner::{self, ProcessHandle};
use crate::scan::{self, DiscoveryCounters, ScanContext};
use crate::tool::{self, ToolCapabilities};

/// Trailing window for throughput smoothing.
const SPEED_WINDOW: usize = 5;

/// Exit code the tool uses for a partial transfer, typically caused by
/// unreadable files.
const PARTIAL_TRANSFER_EXIT_CODE: i32 = 23;

/// What a finished run amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub cancelled: bool,
    /// Whether the sync phase ran at all (confirmation granted or plan
    /// skipped). A declined plan leaves this false.
    pub synced: bool,
    pub succeeded: usize,
    pub failed: usize,
}

struct Shared {
    executable: PathBuf,
    events: UnboundedSender<RunEvent>,
    phase: Mutex<RunPhase>,
    cancel: Arc<AtomicBool>,
    abandon: Arc<AtomicBool>,
    counters: Arc<DiscoveryCounters>,
    rows: Arc<Mutex<HashMap<ItemId, PlanRow>>>,
    order: Mutex<Vec<ItemId>>,
    processes: Arc<Mutex<HashMap<ItemId, ProcessHandle>>>,
    large_plan_flagged: Arc<AtomicBool>,
    permission_hinted: AtomicBool,
    latest_sample: Mutex<Option<ProgressSample>>,
    confirm_tx: Mutex<Option<oneshot::Sender<bool>>>,
    capabilities: OnceCell<ToolCapabilities>,
    debug: Arc<DebugLog>,
}

/// Drives plan → confirm → sync over a snapshot of item pairs.
#[derive(Clone)]
pub struct RunOrchestrator {
    shared: Arc<Shared>,
}

impl RunOrchestrator {
    /// Create an orchestrator for the given tool executable, plus the event
    /// stream collaborators consume.
    pub fn new(executable: PathBuf) -> (Self, UnboundedReceiver<RunEvent>) {
        let (events, receiver) = unbounded_channel();
        let orchestrator = Self {
            shared: Arc::new(Shared {
                executable,
                events,
                phase: Mutex::new(RunPhase::Idle),
                cancel: Arc::new(AtomicBool::new(false)),
                abandon: Arc::new(AtomicBool::new(false)),
                counters: Arc::new(DiscoveryCounters::default()),
                rows: Arc::new(Mutex::new(HashMap::new())),
                order: Mutex::new(Vec::new()),
                processes: Arc::new(Mutex::new(HashMap::new())),
                large_plan_flagged: Arc::new(AtomicBool::new(false)),
                permission_hinted: AtomicBool::new(false),
                latest_sample: Mutex::new(None),
                confirm_tx: Mutex::new(None),
                capabilities: OnceCell::new(),
                debug: Arc::new(DebugLog::new()),
            }),
        };
        (orchestrator, receiver)
    }

    pub fn phase(&self) -> RunPhase {
        *self.shared.phase.lock()
    }

    /// Plan rows in original snapshot order, regardless of which scan
    /// finished first.
    pub fn plan_rows(&self) -> Vec<PlanRow> {
        let rows = self.shared.rows.lock();
        self.shared
            .order
            .lock()
            .iter()
            .filter_map(|id| rows.get(id).cloned())
            .collect()
    }

    /// Total (files, bytes) over the currently-known plan rows.
    pub fn plan_totals(&self) -> (u64, u64) {
        let rows = self.plan_rows();
        (
            rows.iter().map(|row| row.files).sum(),
            rows.iter().map(|row| row.bytes).sum(),
        )
    }

    /// Live global discovery counters (files, bytes).
    pub fn discovery(&self) -> (u64, u64) {
        self.shared.counters.snapshot()
    }

    pub fn latest_sample(&self) -> Option<ProgressSample> {
        self.shared.latest_sample.lock().clone()
    }

    pub fn large_plan_flagged(&self) -> bool {
        self.shared.large_plan_flagged.load(Ordering::SeqCst)
    }

    pub fn permission_hinted(&self) -> bool {
        self.shared.permission_hinted.load(Ordering::SeqCst)
    }

    /// Accumulated raw tool output.
    pub fn debug_text(&self) -> String {
        self.shared.debug.snapshot()
    }

    /// Approve the awaited plan; no-op outside `AwaitingConfirm`.
    pub fn confirm(&self) {
        if let Some(tx) = self.shared.confirm_tx.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Decline the awaited plan. The run returns to idle; the plan stays
    /// visible for inspection.
    pub fn decline(&self) {
        if let Some(tx) = self.shared.confirm_tx.lock().take() {
            let _ = tx.send(false);
        }
    }

    /// Abandon planning and proceed straight to the real transfer. Only
    /// meaningful while checking; sync progress then has no byte baseline.
    pub fn skip_plan(&self) {
        if *self.shared.phase.lock() != RunPhase::Checking {
            return;
        }
        if self.shared.abandon.swap(true, Ordering::SeqCst) {
            return;
        }
        self.terminate_processes();
    }

    /// Cancel the run. Idempotent; a second request changes nothing.
    pub fn stop(&self) {
        if self.shared.cancel.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shared.confirm_tx.lock().take() {
            let _ = tx.send(false);
        }
        self.terminate_processes();
    }

    fn terminate_processes(&self) {
        let handles: Vec<ProcessHandle> = self.shared.processes.lock().values().cloned().collect();
        for handle in handles {
            handle.terminate();
        }
    }

    /// Execute one full run over `items`. Resolves once the run is back to
    /// idle; progress streams through the event channel meanwhile.
    pub async fn run(&self, items: Vec<ItemPair>) -> Result<RunSummary> {
        if items.is_empty() {
            return Err(eyre!("refusing to start a run with an empty item list"));
        }
        {
            let mut phase = self.shared.phase.lock();
            if *phase != RunPhase::Idle {
                return Err(eyre!("a run is already in progress"));
            }
            *phase = RunPhase::Checking;
        }
        self.emit(RunEvent::PhaseChanged(RunPhase::Checking));
        self.reset_run_state(&items);

        let snapshot = RunSnapshot::new(items);
        let capabilities = self.capabilities().await;

        let outcome = scan::run_scans(&snapshot, &self.scan_context()).await;

        if self.shared.cancel.load(Ordering::SeqCst) {
            return Ok(self.finish(true, false, 0, 0));
        }

        let mut baseline: HashMap<ItemId, PlanRow> = HashMap::new();
        if outcome.completed {
            let rows = self.plan_rows();
            let total_files = rows.iter().map(|row| row.files).sum();
            let total_bytes = rows.iter().map(|row| row.bytes).sum();
            for row in &rows {
                baseline.insert(row.item_id.clone(), row.clone());
            }

            self.set_phase(RunPhase::AwaitingConfirm);
            self.emit(RunEvent::PlanReady {
                rows,
                total_files,
                total_bytes,
            });

            let (tx, rx) = oneshot::channel();
            *self.shared.confirm_tx.lock() = Some(tx);
            let confirmed = rx.await.unwrap_or(false);
            self.shared.confirm_tx.lock().take();

            if !confirmed {
                let cancelled = self.shared.cancel.load(Ordering::SeqCst);
                return Ok(self.finish(cancelled, false, 0, 0));
            }
        } else if !self.shared.abandon.load(Ordering::SeqCst) {
            // Scans wound down without a skip request: a cancel raced us.
            return Ok(self.finish(true, false, 0, 0));
        }

        self.set_phase(RunPhase::Syncing);
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for item in snapshot.items() {
            if self.shared.cancel.load(Ordering::SeqCst) {
                break;
            }
            match self
                .sync_item(
                    item,
                    baseline.get(&item.id),
                    capabilities.structured_progress,
                )
                .await
            {
                ItemOutcome::Success => succeeded += 1,
                ItemOutcome::Failed => failed += 1,
                ItemOutcome::Cancelled => {}
            }
        }

        let cancelled = self.shared.cancel.load(Ordering::SeqCst);
        Ok(self.finish(cancelled, true, succeeded, failed))
    }

    async fn sync_item(
        &self,
        item: &ItemPair,
        planned: Option<&PlanRow>,
        structured_progress: bool,
    ) -> ItemOutcome {
        let inv = invocation::transfer(item, structured_progress);
        self.emit(RunEvent::ItemStarted {
            item_id: item.id.clone(),
            source_shown: inv.source_shown.clone(),
            dest_shown: inv.dest_shown.clone(),
        });

        let mut lines = LineBuffer::default();
        let mut smoother = SpeedSmoother::new(SPEED_WINDOW);

        let result = {
            let processes = Arc::clone(&self.shared.processes);
            let item_id = item.id.clone();
            let cancel = Arc::clone(&self.shared.cancel);
            runner::run(
                &self.shared.executable,
                &inv.args,
                move |handle| {
                    processes.lock().insert(item_id, handle.clone());
                    // A stop that raced the spawn still reaches this process.
                    if cancel.load(Ordering::SeqCst) {
                        handle.terminate();
                    }
                },
                |chunk| {
                    self.shared.debug.append(chunk);
                    for line in lines.push(chunk) {
                        if let Some(update) = parse_progress_line(&line) {
                            let sample = rebased_sample(&update, planned, &mut smoother);
                            self.publish_sample(&item.id, sample);
                        } else if let Some(percent) = parse_percent_only(&line) {
                            let sample = fallback_sample(percent, planned, smoother.average());
                            self.publish_sample(&item.id, sample);
                        }
                    }
                },
            )
            .await
        };
        self.shared.processes.lock().remove(&item.id);

        if result.cancelled || self.shared.cancel.load(Ordering::SeqCst) {
            self.emit(RunEvent::ItemFinished {
                item_id: item.id.clone(),
                outcome: ItemOutcome::Cancelled,
                message: format!("{}: cancelled", inv.source_shown),
            });
            return ItemOutcome::Cancelled;
        }

        if result.exit_code == 0 {
            if let Some(row) = planned {
                // Land the display exactly on the planned totals.
                self.publish_sample(&item.id, completed_sample(row, smoother.average()));
            }
            self.emit(RunEvent::ItemFinished {
                item_id: item.id.clone(),
                outcome: ItemOutcome::Success,
                message: format!("{} -> {}: completed", inv.source_shown, inv.dest_shown),
            });
            ItemOutcome::Success
        } else {
            let diagnostic = result
                .last_diagnostic
                .clone()
                .unwrap_or_else(|| "no diagnostic output".to_string());
            self.emit(RunEvent::ItemFinished {
                item_id: item.id.clone(),
                outcome: ItemOutcome::Failed,
                message: format!(
                    "{} -> {}: exit code {} ({diagnostic})",
                    inv.source_shown, inv.dest_shown, result.exit_code
                ),
            });
            self.maybe_permission_hint(
                result.exit_code,
                result.last_diagnostic.as_deref(),
                &item.source,
            );
            ItemOutcome::Failed
        }
    }

    fn maybe_permission_hint(&self, exit_code: i32, diagnostic: Option<&str>, source: &str) {
        if !looks_permission_restricted(exit_code, diagnostic, source) {
            return;
        }
        if self.shared.permission_hinted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(RunEvent::Advisory {
            kind: Advisory::PermissionHint,
            text: permission_hint_text(source),
        });
    }

    async fn capabilities(&self) -> ToolCapabilities {
        if let Some(capabilities) = self.shared.capabilities.get() {
            return capabilities.clone();
        }
        let probed = tool::probe_capabilities(&self.shared.executable).await;
        let _ = self.shared.capabilities.set(probed.clone());
        probed
    }

    fn scan_context(&self) -> ScanContext {
        ScanContext {
            executable: self.shared.executable.clone(),
            counters: Arc::clone(&self.shared.counters),
            rows: Arc::clone(&self.shared.rows),
            processes: Arc::clone(&self.shared.processes),
            cancel: Arc::clone(&self.shared.cancel),
            abandon: Arc::clone(&self.shared.abandon),
            large_plan_flagged: Arc::clone(&self.shared.large_plan_flagged),
            debug: Arc::clone(&self.shared.debug),
            events: self.shared.events.clone(),
        }
    }

    fn reset_run_state(&self, items: &[ItemPair]) {
        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.abandon.store(false, Ordering::SeqCst);
        self.shared.large_plan_flagged.store(false, Ordering::SeqCst);
        self.shared.permission_hinted.store(false, Ordering::SeqCst);
        self.shared.counters.reset();
        self.shared.rows.lock().clear();
        *self.shared.order.lock() = items.iter().map(|item| item.id.clone()).collect();
        *self.shared.latest_sample.lock() = None;
    }

    fn finish(&self, cancelled: bool, synced: bool, succeeded: usize, failed: usize) -> RunSummary {
        self.set_phase(RunPhase::Idle);
        self.emit(RunEvent::RunFinished { cancelled });
        RunSummary {
            cancelled,
            synced,
            succeeded,
            failed,
        }
    }

    fn set_phase(&self, phase: RunPhase) {
        *self.shared.phase.lock() = phase;
        self.emit(RunEvent::PhaseChanged(phase));
    }

    fn publish_sample(&self, item_id: &ItemId, sample: ProgressSample) {
        *self.shared.latest_sample.lock() = Some(sample.clone());
        self.emit(RunEvent::Progress {
            item_id: item_id.clone(),
            sample,
        });
    }

    fn emit(&self, event: RunEvent) {
        let _ = self.shared.events.send(event);
    }
}

/// Fixed-size trailing moving average over throughput samples.
#[derive(Debug)]
pub struct SpeedSmoother {
    window: VecDeque<f64>,
    cap: usize,
}

impl SpeedSmoother {
    pub fn new(cap: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Record a sample; returns the smoothed value.
    pub fn push(&mut self, value: f64) -> f64 {
        if self.window.len() == self.cap {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.average()
    }

    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().sum::<f64>() / self.window.len() as f64
        }
    }
}

/// Recompute a live update against the plan baseline when one exists; the
/// plan is the more reliable denominator than the tool's own (possibly
/// differently-scoped) percentage.
fn rebased_sample(
    update: &ProgressUpdate,
    planned: Option<&PlanRow>,
    smoother: &mut SpeedSmoother,
) -> ProgressSample {
    let speed = smoother.push(update.speed_bytes_per_sec);
    match planned {
        Some(row) if row.bytes > 0 => {
            let fraction = (update.transferred_bytes as f64 / row.bytes as f64).clamp(0.0, 1.0);
            let remaining = row.bytes.saturating_sub(update.transferred_bytes);
            let eta_seconds = if speed > 0.0 {
                Some((remaining as f64 / speed).round() as u64)
            } else {
                update.eta_seconds
            };
            ProgressSample {
                fraction,
                percent_text: format!("{}%", (fraction * 100.0).round() as u64),
                transferred_bytes: update.transferred_bytes,
                total_bytes: row.bytes,
                transferred_files: interpolated_files(row.files, fraction),
                total_files: row.files,
                speed_bytes_per_sec: speed,
                eta_seconds,
            }
        }
        _ => ProgressSample {
            fraction: update.fraction,
            percent_text: update.percent_text.clone(),
            transferred_bytes: update.transferred_bytes,
            total_bytes: update.approximate_total_bytes().unwrap_or(0),
            transferred_files: 0,
            total_files: 0,
            speed_bytes_per_sec: speed,
            eta_seconds: update.eta_seconds,
        },
    }
}

/// Legacy percent-only reading: fraction and percent text, with byte/file
/// figures derived from the baseline when one exists.
fn fallback_sample(percent: f64, planned: Option<&PlanRow>, speed: f64) -> ProgressSample {
    let fraction = (percent / 100.0).clamp(0.0, 1.0);
    let (total_bytes, total_files) = planned.map_or((0, 0), |row| (row.bytes, row.files));
    ProgressSample {
        fraction,
        percent_text: format!("{}%", percent.round() as u64),
        transferred_bytes: (total_bytes as f64 * fraction).round() as u64,
        total_bytes,
        transferred_files: interpolated_files(total_files, fraction),
        total_files,
        speed_bytes_per_sec: speed,
        eta_seconds: None,
    }
}

fn completed_sample(row: &PlanRow, speed: f64) -> ProgressSample {
    ProgressSample {
        fraction: 1.0,
        percent_text: "100%".to_string(),
        transferred_bytes: row.bytes,
        total_bytes: row.bytes,
        transferred_files: row.files,
        total_files: row.files,
        speed_bytes_per_sec: speed,
        eta_seconds: Some(0),
    }
}

/// Estimated transferred-file count from the byte fraction. An
/// approximation for display; it only converges with the planned total at
/// fraction 1.0.
fn interpolated_files(planned_files: u64, fraction: f64) -> u64 {
    ((planned_files as f64 * fraction).round() as u64).min(planned_files)
}

/// Whether a failure looks like an OS-level access restriction rather than a
/// generic transfer error.
fn looks_permission_restricted(exit_code: i32, diagnostic: Option<&str>, source: &str) -> bool {
    if exit_code == 0 {
        return false;
    }
    if exit_code == PARTIAL_TRANSFER_EXIT_CODE {
        return true;
    }
    let diagnostic = diagnostic.unwrap_or("").to_ascii_lowercase();
    const PHRASES: [&str; 3] = ["permission denied", "not permitted", "failed to open"];
    if PHRASES.iter().any(|phrase| diagnostic.contains(phrase)) {
        return true;
    }
    protected_library_source(source)
}

/// Source paths living in a system-protected library need the user to grant
/// access in the OS privacy settings; the tool can only report read errors.
fn protected_library_source(source: &str) -> bool {
    let lowered = source.to_ascii_lowercase();
    lowered.contains(".photoslibrary")
        || (lowered.contains("/users/") && lowered.contains("/library"))
}

fn permission_hint_text(source: &str) -> String {
    if protected_library_source(source) {
        format!(
            "Reading {source} appears blocked by system privacy protections. Grant Full Disk \
             Access in System Settings > Privacy & Security and run again."
        )
    } else {
        "Some files could not be read. If the source lives in a protected location, grant Full \
         Disk Access in System Settings > Privacy & Security."
            .to_string()
    }
}
