//! End-to-end workflow tests driven through a fake tool executable.
//!
//! The script below impersonates the external tool: it answers the version
//! probe, replays canned dry-run and transfer output for whichever source
//! directory it is pointed at, and can stall so cancellation has something to
//! interrupt.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use eyre::Result;
use tokio::sync::mpsc::UnboundedReceiver;

use convoy_core::{
    Advisory, ItemId, ItemOutcome, ItemPair, RunEvent, RunOrchestrator, RunPhase, RunSummary,
};

const FAKE_TOOL: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "faketool  version 3.2.7  protocol version 31"
    exit 0
fi
prev=""
src=""
for arg in "$@"; do
    src="$prev"
    prev="$arg"
done
case "$*" in
*--dry-run*)
    [ -f "${src}scan_stall" ] && exec sleep "$(cat "${src}scan_stall")"
    [ -f "${src}scan_delay" ] && sleep "$(cat "${src}scan_delay")"
    [ -f "${src}scan_output" ] && cat "${src}scan_output"
    ;;
*)
    [ -f "${src}sync_output" ] && cat "${src}sync_output"
    [ -f "${src}sync_sleep" ] && exec sleep "$(cat "${src}sync_sleep")"
    [ -f "${src}sync_exit" ] && exit "$(cat "${src}sync_exit")"
    ;;
esac
exit 0
"#;

struct Fixture {
    temp: tempfile::TempDir,
    tool: PathBuf,
}

impl Fixture {
    fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let tool = temp.path().join("faketool");
        fs::write(&tool, FAKE_TOOL)?;
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755))?;
        Ok(Self { temp, tool })
    }

    /// Create a source directory for one item and return the configured pair.
    fn item(&self, name: &str) -> Result<ItemPair> {
        let source = self.temp.path().join("src").join(name);
        fs::create_dir_all(&source)?;
        Ok(ItemPair::folder(
            ItemId::new(name),
            source.to_string_lossy().into_owned(),
            self.temp.path().join("backup").to_string_lossy().into_owned(),
        ))
    }

    /// Drop a control file into an item's source directory.
    fn control(&self, item: &ItemPair, file: &str, contents: &str) -> Result<()> {
        fs::write(PathBuf::from(&item.source).join(file), contents)?;
        Ok(())
    }

    /// Canned dry-run output: `count` files of `size` bytes plus one
    /// directory entry the aggregator must skip.
    fn scan_entries(&self, item: &ItemPair, count: usize, size: u64) -> Result<()> {
        let mut output = String::from("0\tsub/\n");
        for index in 0..count {
            output.push_str(&format!("{size}\tsub/file-{index}.bin\n"));
        }
        self.control(item, "scan_output", &output)
    }

    fn orchestrator(&self) -> (RunOrchestrator, UnboundedReceiver<RunEvent>) {
        RunOrchestrator::new(self.tool.clone())
    }
}

/// Run the workflow while reacting to its event stream; returns the summary
/// plus every event observed, in order.
async fn pump<F>(
    orchestrator: &RunOrchestrator,
    receiver: &mut UnboundedReceiver<RunEvent>,
    items: Vec<ItemPair>,
    mut react: F,
) -> Result<(RunSummary, Vec<RunEvent>)>
where
    F: FnMut(&RunEvent, &RunOrchestrator),
{
    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(items).await })
    };

    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        react(&event, orchestrator);
        let finished = matches!(event, RunEvent::RunFinished { .. });
        events.push(event);
        if finished {
            break;
        }
    }

    let summary = runner.await??;
    Ok((summary, events))
}

fn finished_items(events: &[RunEvent]) -> Vec<(ItemId, ItemOutcome)> {
    events
        .iter()
        .filter_map(|event| match event {
            RunEvent::ItemFinished {
                item_id, outcome, ..
            } => Some((item_id.clone(), *outcome)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn plan_rows_stay_in_snapshot_order_despite_completion_order() -> Result<()> {
    let fixture = Fixture::new()?;
    let a = fixture.item("a")?;
    let b = fixture.item("b")?;
    let c = fixture.item("c")?;
    fixture.scan_entries(&a, 1, 10)?;
    fixture.scan_entries(&b, 2, 10)?;
    fixture.scan_entries(&c, 3, 10)?;
    // With two scan slots, a and b start first; a finishes last, so rows
    // complete in the order b, c, a.
    fixture.control(&a, "scan_delay", "0.6")?;
    fixture.control(&b, "scan_delay", "0.1")?;

    let (orchestrator, mut receiver) = fixture.orchestrator();
    let (summary, events) = pump(
        &orchestrator,
        &mut receiver,
        vec![a, b, c],
        |event, orchestrator| {
            if matches!(event, RunEvent::PlanReady { .. }) {
                orchestrator.decline();
            }
        },
    )
    .await?;

    let plan = events
        .iter()
        .find_map(|event| match event {
            RunEvent::PlanReady { rows, .. } => Some(rows.clone()),
            _ => None,
        })
        .expect("plan event");
    let ids: Vec<&str> = plan.iter().map(|row| row.item_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    let files: Vec<u64> = plan.iter().map(|row| row.files).collect();
    assert_eq!(files, vec![1, 2, 3]);

    assert!(!summary.cancelled);
    assert!(!summary.synced);
    Ok(())
}

#[tokio::test]
async fn confirmed_run_aggregates_totals_and_syncs_sequentially() -> Result<()> {
    let fixture = Fixture::new()?;
    let one = fixture.item("one")?;
    let two = fixture.item("two")?;
    fixture.scan_entries(&one, 10, 100_000)?;
    fixture.scan_entries(&two, 5, 100_000)?;
    fixture.control(&one, "sync_output", "500000  50%   1.0MB/s   0:00:01\n")?;
    fixture.control(&two, "sync_output", "250000  50%   1.0MB/s   0:00:01\n")?;

    let (orchestrator, mut receiver) = fixture.orchestrator();
    let (summary, events) = pump(
        &orchestrator,
        &mut receiver,
        vec![one.clone(), two.clone()],
        |event, orchestrator| {
            if let RunEvent::PlanReady {
                total_files,
                total_bytes,
                ..
            } = event
            {
                assert_eq!(*total_files, 15);
                assert_eq!(*total_bytes, 1_500_000);
                orchestrator.confirm();
            }
        },
    )
    .await?;

    assert!(!summary.cancelled);
    assert!(summary.synced);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(orchestrator.phase(), RunPhase::Idle);

    // The live sample is rebased against the planned total, not the tool's
    // own percentage scope.
    let rebased = events
        .iter()
        .find_map(|event| match event {
            RunEvent::Progress { item_id, sample }
                if item_id == &one.id && sample.transferred_bytes == 500_000 =>
            {
                Some(sample.clone())
            }
            _ => None,
        })
        .expect("rebased sample for item one");
    assert!((rebased.fraction - 0.5).abs() < 1e-9);
    assert_eq!(rebased.total_bytes, 1_000_000);
    assert_eq!(rebased.transferred_files, 5);
    assert_eq!(rebased.total_files, 10);

    // Item one lands on fraction 1.0 before item two ever starts.
    let one_done = events
        .iter()
        .position(|event| {
            matches!(event, RunEvent::Progress { item_id, sample }
                if item_id == &one.id && sample.fraction == 1.0)
        })
        .expect("completion sample for item one");
    let two_started = events
        .iter()
        .position(|event| matches!(event, RunEvent::ItemStarted { item_id, .. } if item_id == &two.id))
        .expect("start of item two");
    assert!(one_done < two_started);

    assert_eq!(
        finished_items(&events),
        vec![
            (one.id.clone(), ItemOutcome::Success),
            (two.id.clone(), ItemOutcome::Success),
        ]
    );

    // Every raw chunk from every process is retained for diagnostics.
    assert!(orchestrator.debug_text().contains("sub/file-0.bin"));
    Ok(())
}

#[tokio::test]
async fn stopping_twice_terminates_once_and_lands_idle() -> Result<()> {
    let fixture = Fixture::new()?;
    let item = fixture.item("stall")?;
    fixture.scan_entries(&item, 2, 1_000)?;
    fixture.control(&item, "sync_output", "1000  50%   1.0MB/s   0:00:01\n")?;
    fixture.control(&item, "sync_sleep", "30")?;

    let (orchestrator, mut receiver) = fixture.orchestrator();
    let (summary, events) = pump(
        &orchestrator,
        &mut receiver,
        vec![item.clone()],
        |event, orchestrator| match event {
            RunEvent::PlanReady { .. } => orchestrator.confirm(),
            RunEvent::Progress { .. } => {
                orchestrator.stop();
                orchestrator.stop();
            }
            _ => {}
        },
    )
    .await?;

    assert!(summary.cancelled);
    assert_eq!(orchestrator.phase(), RunPhase::Idle);
    assert_eq!(
        finished_items(&events),
        vec![(item.id.clone(), ItemOutcome::Cancelled)]
    );
    Ok(())
}

#[tokio::test]
async fn skip_plan_routes_straight_to_syncing() -> Result<()> {
    let fixture = Fixture::new()?;
    let item = fixture.item("skipped")?;
    fixture.control(&item, "scan_stall", "30")?;
    fixture.control(&item, "sync_output", "  1234567  12%   34.56MB/s    0:00:12\n")?;

    let (orchestrator, mut receiver) = fixture.orchestrator();
    let (summary, events) = pump(
        &orchestrator,
        &mut receiver,
        vec![item.clone()],
        |event, orchestrator| {
            if matches!(event, RunEvent::PhaseChanged(RunPhase::Checking)) {
                orchestrator.skip_plan();
            }
        },
    )
    .await?;

    assert!(!summary.cancelled);
    assert!(summary.synced);
    assert_eq!(summary.succeeded, 1);

    // No confirmation gate on this path, and no plan either.
    assert!(!events
        .iter()
        .any(|event| matches!(event, RunEvent::PlanReady { .. })));
    assert!(!events
        .iter()
        .any(|event| matches!(event, RunEvent::PhaseChanged(RunPhase::AwaitingConfirm))));
    assert!(events
        .iter()
        .any(|event| matches!(event, RunEvent::PhaseChanged(RunPhase::Syncing))));

    // Without a baseline the sample trusts the tool's own figures.
    let sample = events
        .iter()
        .find_map(|event| match event {
            RunEvent::Progress { sample, .. } => Some(sample.clone()),
            _ => None,
        })
        .expect("progress without baseline");
    assert!((sample.fraction - 0.12).abs() < 1e-9);
    assert_eq!(sample.total_files, 0);
    Ok(())
}

#[tokio::test]
async fn declining_keeps_the_plan_visible() -> Result<()> {
    let fixture = Fixture::new()?;
    let item = fixture.item("declined")?;
    fixture.scan_entries(&item, 3, 500)?;

    let (orchestrator, mut receiver) = fixture.orchestrator();
    let (summary, _) = pump(
        &orchestrator,
        &mut receiver,
        vec![item],
        |event, orchestrator| {
            if matches!(event, RunEvent::PlanReady { .. }) {
                orchestrator.decline();
            }
        },
    )
    .await?;

    assert!(!summary.cancelled);
    assert!(!summary.synced);
    assert_eq!(orchestrator.phase(), RunPhase::Idle);

    // The declined plan stays around for inspection.
    let rows = orchestrator.plan_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].files, 3);
    assert_eq!(orchestrator.plan_totals(), (3, 1_500));
    Ok(())
}

#[tokio::test]
async fn large_plan_advisory_fires_exactly_once() -> Result<()> {
    let fixture = Fixture::new()?;
    let item = fixture.item("huge")?;
    // Two entries at the 500 GiB threshold: the first breaches, the second
    // must not re-raise the advisory.
    fixture.control(
        &item,
        "scan_output",
        "536870912000\tdisk-a.img\n536870912000\tdisk-b.img\n",
    )?;

    let (orchestrator, mut receiver) = fixture.orchestrator();
    let (_, events) = pump(
        &orchestrator,
        &mut receiver,
        vec![item],
        |event, orchestrator| {
            if matches!(event, RunEvent::PlanReady { .. }) {
                orchestrator.decline();
            }
        },
    )
    .await?;

    let advisories = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                RunEvent::Advisory {
                    kind: Advisory::LargePlan,
                    ..
                }
            )
        })
        .count();
    assert_eq!(advisories, 1);
    assert!(orchestrator.large_plan_flagged());
    Ok(())
}

#[tokio::test]
async fn permission_failure_hints_once_and_the_run_continues() -> Result<()> {
    let fixture = Fixture::new()?;
    let blocked = fixture.item("blocked")?;
    let healthy = fixture.item("healthy")?;
    fixture.scan_entries(&blocked, 1, 100)?;
    fixture.scan_entries(&healthy, 1, 100)?;
    fixture.control(
        &blocked,
        "sync_output",
        "rsync: opendir failed: Permission denied (13)\n",
    )?;
    fixture.control(&blocked, "sync_exit", "23")?;

    let (orchestrator, mut receiver) = fixture.orchestrator();
    let (summary, events) = pump(
        &orchestrator,
        &mut receiver,
        vec![blocked.clone(), healthy.clone()],
        |event, orchestrator| {
            if matches!(event, RunEvent::PlanReady { .. }) {
                orchestrator.confirm();
            }
        },
    )
    .await?;

    // A failed item never aborts the run.
    assert!(summary.synced);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);

    let failure = events
        .iter()
        .find_map(|event| match event {
            RunEvent::ItemFinished {
                item_id,
                outcome: ItemOutcome::Failed,
                message,
            } if item_id == &blocked.id => Some(message.clone()),
            _ => None,
        })
        .expect("failure message");
    assert!(failure.contains("exit code 23"), "message: {failure}");

    let hints = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                RunEvent::Advisory {
                    kind: Advisory::PermissionHint,
                    ..
                }
            )
        })
        .count();
    assert_eq!(hints, 1);
    assert!(orchestrator.permission_hinted());
    Ok(())
}
