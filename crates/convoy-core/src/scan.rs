//! Bounded-concurrency dry-run fan-out across the run snapshot.
//!
//! Each item gets one counting dry-run process; a counting gate keeps at
//! most two scans alive to bound filesystem and network load. Discovery
//! counters update live, plan rows land atomically per item, and the
//! externally visible plan is always re-derived in snapshot order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;

use crate::debug_log::DebugLog;
use crate::events::{Advisory, PlanRow, RunEvent};
use crate::invocation;
use crate::item::{ItemId, ItemPair, RunSnapshot};
use crate::parser::{parse_entry_line, LineBuffer};
use crate::runner::{self, ProcessHandle};

/// Concurrency ceiling for dry-run scans.
pub const MAX_CONCURRENT_SCANS: usize = 2;

/// Discovery thresholds for the large-dataset advisory.
pub const LARGE_PLAN_FILE_THRESHOLD: u64 = 150_000;
pub const LARGE_PLAN_BYTE_THRESHOLD: u64 = 500 * 1024 * 1024 * 1024;

pub(crate) const LARGE_PLAN_ADVISORY_TEXT: &str = "This is a large backup. You can keep planning \
     for exact totals, or skip the rest of the plan and start copying now (progress will then \
     show raw throughput instead of a percentage).";

/// Live global discovery totals, summed across all items scanned so far.
#[derive(Debug, Default)]
pub struct DiscoveryCounters {
    files: AtomicU64,
    bytes: AtomicU64,
}

impl DiscoveryCounters {
    /// Record one discovered entry; returns the new global totals.
    pub fn add(&self, files: u64, bytes: u64) -> (u64, u64) {
        let files = self.files.fetch_add(files, Ordering::SeqCst) + files;
        let bytes = self.bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        (files, bytes)
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.files.load(Ordering::SeqCst),
            self.bytes.load(Ordering::SeqCst),
        )
    }

    pub fn reset(&self) {
        self.files.store(0, Ordering::SeqCst);
        self.bytes.store(0, Ordering::SeqCst);
    }
}

/// Whether live discovery totals have crossed the large-dataset thresholds.
pub fn large_plan_breached(files: u64, bytes: u64) -> bool {
    files >= LARGE_PLAN_FILE_THRESHOLD || bytes >= LARGE_PLAN_BYTE_THRESHOLD
}

/// Everything a scan pass shares with the orchestrator.
pub(crate) struct ScanContext {
    pub executable: PathBuf,
    pub counters: Arc<DiscoveryCounters>,
    pub rows: Arc<Mutex<HashMap<ItemId, PlanRow>>>,
    pub processes: Arc<Mutex<HashMap<ItemId, ProcessHandle>>>,
    pub cancel: Arc<AtomicBool>,
    pub abandon: Arc<AtomicBool>,
    pub large_plan_flagged: Arc<AtomicBool>,
    pub debug: Arc<DebugLog>,
    pub events: UnboundedSender<RunEvent>,
}

impl ScanContext {
    fn halted(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.abandon.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScanOutcome {
    /// False when the pass was cancelled or abandoned; partial rows from
    /// such a pass must not be trusted.
    pub completed: bool,
}

/// Run one counting dry-run per snapshot item, at most
/// [`MAX_CONCURRENT_SCANS`] at a time.
pub(crate) async fn run_scans(snapshot: &RunSnapshot, ctx: &ScanContext) -> ScanOutcome {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SCANS));
    let mut tasks = Vec::with_capacity(snapshot.len());

    for item in snapshot.items() {
        tasks.push(tokio::spawn(scan_item(
            item.clone(),
            Arc::clone(&semaphore),
            item_context(ctx),
        )));
    }

    for task in tasks {
        if let Err(err) = task.await {
            log::warn!("scan task panicked: {err}");
        }
    }

    let completed = !ctx.halted();
    if !completed {
        // Partially-built rows from a cancelled or abandoned pass are
        // discarded; totals must always equal the sum of trusted rows.
        ctx.rows.lock().clear();
    }
    ScanOutcome { completed }
}

struct ItemScanContext {
    executable: PathBuf,
    counters: Arc<DiscoveryCounters>,
    rows: Arc<Mutex<HashMap<ItemId, PlanRow>>>,
    processes: Arc<Mutex<HashMap<ItemId, ProcessHandle>>>,
    cancel: Arc<AtomicBool>,
    abandon: Arc<AtomicBool>,
    large_plan_flagged: Arc<AtomicBool>,
    debug: Arc<DebugLog>,
    events: UnboundedSender<RunEvent>,
}

impl ItemScanContext {
    fn halted(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.abandon.load(Ordering::SeqCst)
    }
}

fn item_context(ctx: &ScanContext) -> ItemScanContext {
    ItemScanContext {
        executable: ctx.executable.clone(),
        counters: Arc::clone(&ctx.counters),
        rows: Arc::clone(&ctx.rows),
        processes: Arc::clone(&ctx.processes),
        cancel: Arc::clone(&ctx.cancel),
        abandon: Arc::clone(&ctx.abandon),
        large_plan_flagged: Arc::clone(&ctx.large_plan_flagged),
        debug: Arc::clone(&ctx.debug),
        events: ctx.events.clone(),
    }
}

async fn scan_item(item: ItemPair, semaphore: Arc<Semaphore>, ctx: ItemScanContext) {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    if ctx.halted() {
        return;
    }

    let inv = invocation::counting_dry_run(&item);
    log::debug!(
        "scanning {}: {} -> {}",
        item.id,
        inv.source_shown,
        inv.dest_shown
    );

    let mut lines = LineBuffer::default();
    let mut files = 0u64;
    let mut bytes = 0u64;

    let result = {
        let processes = Arc::clone(&ctx.processes);
        let item_id = item.id.clone();
        let cancel = Arc::clone(&ctx.cancel);
        let abandon = Arc::clone(&ctx.abandon);
        runner::run(
            &ctx.executable,
            &inv.args,
            move |handle| {
                processes.lock().insert(item_id, handle.clone());
                // A stop that raced the spawn still reaches this process.
                if cancel.load(Ordering::SeqCst) || abandon.load(Ordering::SeqCst) {
                    handle.terminate();
                }
            },
            |chunk| {
                ctx.debug.append(chunk);
                for line in lines.push(chunk) {
                    note_line(&line, &mut files, &mut bytes, &ctx);
                }
            },
        )
        .await
    };

    if let Some(tail) = lines.finish() {
        note_line(&tail, &mut files, &mut bytes, &ctx);
    }
    ctx.processes.lock().remove(&item.id);

    if result.cancelled || ctx.halted() {
        return;
    }
    if result.exit_code != 0 {
        log::warn!(
            "dry-run scan for {} exited with code {}: {}",
            item.id,
            result.exit_code,
            result.last_diagnostic.as_deref().unwrap_or("no output")
        );
    }

    ctx.rows.lock().insert(
        item.id.clone(),
        PlanRow {
            item_id: item.id,
            source_shown: inv.source_shown,
            dest_shown: inv.dest_shown,
            files,
            bytes,
        },
    );
}

fn note_line(line: &str, files: &mut u64, bytes: &mut u64, ctx: &ItemScanContext) {
    let Some(record) = parse_entry_line(line) else {
        return;
    };
    *files += 1;
    *bytes += record.size;

    let (global_files, global_bytes) = ctx.counters.add(1, record.size);
    let _ = ctx.events.send(RunEvent::Discovery {
        files: global_files,
        bytes: global_bytes,
    });

    if large_plan_breached(global_files, global_bytes)
        && !ctx.large_plan_flagged.swap(true, Ordering::SeqCst)
    {
        let _ = ctx.events.send(RunEvent::Advisory {
            kind: Advisory::LargePlan,
            text: LARGE_PLAN_ADVISORY_TEXT.to_string(),
        });
    }
}
