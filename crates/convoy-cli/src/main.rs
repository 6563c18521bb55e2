use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use convoy_core::{store, tool};
use convoy_core::{
    Advisory, ItemId, ItemMode, ItemOutcome, ItemPair, PlanRow, RunEvent, RunOrchestrator,
    RunPhase, RunSummary,
};
use eyre::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const DEBUG_LOG_FILE: &str = "debug.log";

/// Granularity of the sync progress bar; fractions map onto this range.
const BAR_TICKS: u64 = 10_000;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Plan, confirm, and run mirrored backups of configured folder pairs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a source/target pair to the configured items
    Add(AddArgs),
    /// Remove a configured pair by id
    Remove(RemoveArgs),
    /// Show the configured pairs
    List,
    /// Dry-run every pair and print the plan without transferring anything
    Plan,
    /// Plan, confirm, and mirror the configured pairs
    Run(RunArgs),
    /// Print the raw tool output captured by the last plan or run
    Log,
}

#[derive(Args)]
struct AddArgs {
    /// Source folder to mirror
    source: String,
    /// Target folder to mirror into
    target: String,
    /// Restrict the pair to this file (relative to the source); repeatable
    #[arg(long = "file", value_name = "REL_PATH")]
    files: Vec<String>,
}

#[derive(Args)]
struct RemoveArgs {
    /// Id of the pair to remove (see `convoy list`)
    id: String,
}

#[derive(Args)]
struct RunArgs {
    /// Confirm the plan without prompting
    #[arg(long)]
    yes: bool,
    /// Skip planning entirely and start copying immediately
    #[arg(long)]
    skip_plan: bool,
    /// Run only the pair with this id; repeatable
    #[arg(long = "item", value_name = "ID")]
    items: Vec<String>,
}

/// How the confirmation gate is answered.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Gate {
    /// Ask on the terminal.
    Prompt,
    /// Confirm without asking (`--yes`).
    Auto,
    /// Always decline; used by `plan` to stop after the checking phase.
    Decline,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Add(args) => run_add(args),
        Commands::Remove(args) => run_remove(args),
        Commands::List => run_list(),
        Commands::Plan => run_plan().await,
        Commands::Run(args) => run_run(args).await,
        Commands::Log => run_log(),
    }
}

fn run_add(args: &AddArgs) -> Result<()> {
    let mut items = store::load_items();
    let id = ItemId::new(next_id(&items));
    let item = if args.files.is_empty() {
        ItemPair::folder(id.clone(), args.source.clone(), args.target.clone())
    } else {
        ItemPair::selected_files(
            id.clone(),
            args.source.clone(),
            args.target.clone(),
            args.files.clone(),
        )
    };
    items.push(item);
    store::save_items(&items)?;
    println!("Added pair {id}: {} -> {}", args.source, args.target);
    Ok(())
}

fn run_remove(args: &RemoveArgs) -> Result<()> {
    let mut items = store::load_items();
    let before = items.len();
    items.retain(|item| item.id.as_str() != args.id);
    if items.len() == before {
        bail!("no configured pair with id {}", args.id);
    }
    store::save_items(&items)?;
    println!("Removed pair {}.", args.id);
    Ok(())
}

fn run_list() -> Result<()> {
    let items = store::load_items();
    if items.is_empty() {
        println!("No pairs configured. Add one with `convoy add <source> <target>`.");
        return Ok(());
    }
    for item in &items {
        println!(
            "{:>4}  {:<14} {} -> {}{}",
            item.id,
            mode_label(item),
            item.source,
            item.target,
            match item.selected.as_deref() {
                Some(files) => format!("  ({} file(s))", files.len()),
                None => String::new(),
            }
        );
    }
    Ok(())
}

async fn run_plan() -> Result<()> {
    let items = store::load_items();
    if items.is_empty() {
        bail!("nothing to plan; add a pair first with `convoy add`");
    }
    drive(items, Gate::Decline, false).await?;
    Ok(())
}

async fn run_run(args: &RunArgs) -> Result<()> {
    let items = select_items(store::load_items(), &args.items)?;
    if items.is_empty() {
        bail!("nothing to run; add a pair first with `convoy add`");
    }
    let gate = if args.yes { Gate::Auto } else { Gate::Prompt };
    let summary = drive(items, gate, args.skip_plan).await?;
    if summary.synced && summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn run_log() -> Result<()> {
    let path = store::config_dir()?.join(DEBUG_LOG_FILE);
    match fs::read_to_string(&path) {
        Ok(text) => {
            print!("{text}");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("No captured output yet; run `convoy plan` or `convoy run` first.");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Keep only the requested ids, in configured order. An unknown id is an
/// error rather than a silently shorter run.
fn select_items(items: Vec<ItemPair>, ids: &[String]) -> Result<Vec<ItemPair>> {
    if ids.is_empty() {
        return Ok(items);
    }
    for id in ids {
        if !items.iter().any(|item| item.id.as_str() == id) {
            bail!("no configured pair with id {id}");
        }
    }
    Ok(items
        .into_iter()
        .filter(|item| ids.iter().any(|id| item.id.as_str() == id))
        .collect())
}

/// Run the whole workflow, rendering its event stream on the terminal.
async fn drive(items: Vec<ItemPair>, gate: Gate, skip_plan: bool) -> Result<RunSummary> {
    let executable = tool::locate_tool();
    log::debug!("using tool at {}", executable.display());

    let (orchestrator, receiver) = RunOrchestrator::new(executable);
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nStopping...");
                orchestrator.stop();
            }
        });
    }

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(items).await })
    };

    render_events(&orchestrator, receiver, gate, skip_plan).await?;
    let summary = runner.await??;

    if let Err(err) = write_debug_log(&orchestrator) {
        log::warn!("could not persist the debug log: {err}");
    }
    print_summary(&summary);
    Ok(summary)
}

async fn render_events(
    orchestrator: &RunOrchestrator,
    mut receiver: UnboundedReceiver<RunEvent>,
    gate: Gate,
    skip_plan: bool,
) -> Result<()> {
    let mut spinner: Option<ProgressBar> = None;
    let mut bar: Option<ProgressBar> = None;

    while let Some(event) = receiver.recv().await {
        match event {
            RunEvent::PhaseChanged(RunPhase::Checking) => {
                if skip_plan {
                    orchestrator.skip_plan();
                } else {
                    spinner = Some(scan_spinner());
                }
            }
            RunEvent::Discovery { files, bytes } => {
                if let Some(pb) = &spinner {
                    pb.set_message(format!(
                        "Discovered {files} file(s), {} so far",
                        format_bytes(bytes)
                    ));
                }
            }
            RunEvent::PlanReady {
                rows,
                total_files,
                total_bytes,
            } => {
                if let Some(pb) = spinner.take() {
                    pb.finish_and_clear();
                }
                print_plan(&rows, total_files, total_bytes);
                match gate {
                    Gate::Decline => {
                        println!("Plan only; nothing transferred.");
                        orchestrator.decline();
                    }
                    Gate::Auto => orchestrator.confirm(),
                    Gate::Prompt => {
                        let question = format!(
                            "Copy {total_files} file(s), {}?",
                            format_bytes(total_bytes)
                        );
                        if prompt_yes_no(&question).await? {
                            orchestrator.confirm();
                        } else {
                            println!("Declined; nothing transferred.");
                            orchestrator.decline();
                        }
                    }
                }
            }
            RunEvent::PhaseChanged(RunPhase::Syncing) => {
                if let Some(pb) = spinner.take() {
                    pb.finish_and_clear();
                }
            }
            RunEvent::ItemStarted {
                source_shown,
                dest_shown,
                ..
            } => {
                println!("{} {source_shown} -> {dest_shown}", "Syncing".bold());
                bar = Some(sync_bar());
            }
            RunEvent::Progress { sample, .. } => {
                if let Some(pb) = &bar {
                    pb.set_position((sample.fraction * BAR_TICKS as f64) as u64);
                    let eta = sample
                        .eta_seconds
                        .map(|eta| format!(", {} left", format_eta(eta)))
                        .unwrap_or_default();
                    pb.set_message(format!(
                        "{}/s{eta}",
                        format_bytes(sample.speed_bytes_per_sec as u64)
                    ));
                }
            }
            RunEvent::ItemFinished {
                outcome, message, ..
            } => {
                if let Some(pb) = bar.take() {
                    pb.finish_and_clear();
                }
                match outcome {
                    ItemOutcome::Success => println!("{} {message}", "ok".green().bold()),
                    ItemOutcome::Failed => println!("{} {message}", "failed".red().bold()),
                    ItemOutcome::Cancelled => {
                        println!("{} {message}", "cancelled".yellow().bold())
                    }
                }
            }
            RunEvent::Advisory { kind, text } => {
                if let Some(pb) = spinner.take() {
                    pb.finish_and_clear();
                }
                println!("{} {text}", "note".yellow().bold());
                if kind == Advisory::LargePlan && gate == Gate::Prompt {
                    if prompt_yes_no("Skip the rest of the plan and start copying now?").await? {
                        orchestrator.skip_plan();
                    } else if orchestrator.phase() == RunPhase::Checking {
                        spinner = Some(scan_spinner());
                    }
                } else if orchestrator.phase() == RunPhase::Checking {
                    spinner = Some(scan_spinner());
                }
            }
            RunEvent::RunFinished { .. } => {
                if let Some(pb) = spinner.take() {
                    pb.finish_and_clear();
                }
                if let Some(pb) = bar.take() {
                    pb.finish_and_clear();
                }
                break;
            }
            RunEvent::PhaseChanged(_) => {}
        }
    }
    Ok(())
}

fn scan_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["-", "\\", "|", "/"]),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("Scanning configured pairs...");
    pb
}

fn sync_bar() -> ProgressBar {
    let pb = ProgressBar::new(BAR_TICKS);
    pb.set_style(
        ProgressStyle::with_template("  {bar:40} {percent:>3}% {msg}")
            .unwrap()
            .progress_chars("=> "),
    );
    pb
}

fn print_plan(rows: &[PlanRow], total_files: u64, total_bytes: u64) {
    println!("{}", "Plan".bold());
    for row in rows {
        println!(
            "  {:>8} file(s)  {:>10}  {} -> {}",
            row.files,
            format_bytes(row.bytes),
            row.source_shown,
            row.dest_shown
        );
    }
    println!(
        "  Total: {total_files} file(s), {}",
        format_bytes(total_bytes)
    );
}

fn print_summary(summary: &RunSummary) {
    if summary.cancelled {
        println!("{}", "Run cancelled.".yellow());
    } else if summary.synced {
        let line = format!(
            "Run complete: {} succeeded, {} failed.",
            summary.succeeded, summary.failed
        );
        if summary.failed == 0 {
            println!("{}", line.as_str().green());
        } else {
            println!("{}", line.as_str().red());
        }
    }
}

async fn prompt_yes_no(question: &str) -> Result<bool> {
    let question = format!("{question} [y/N] ");
    tokio::task::spawn_blocking(move || -> Result<bool> {
        use std::io::Write;
        print!("{question}");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(matches!(line.trim(), "y" | "Y" | "yes" | "Yes"))
    })
    .await?
}

fn write_debug_log(orchestrator: &RunOrchestrator) -> Result<()> {
    let path = store::config_dir()?.join(DEBUG_LOG_FILE);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    fs::write(&path, orchestrator.debug_text())
        .with_context(|| format!("writing {}", path.display()))
}

/// Smallest positive integer id not yet in use, as a string. Ids that were
/// not numeric to begin with are skipped over.
fn next_id(items: &[ItemPair]) -> String {
    let max = items
        .iter()
        .filter_map(|item| item.id.as_str().parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    (max + 1).to_string()
}

fn mode_label(item: &ItemPair) -> &'static str {
    match item.mode {
        ItemMode::FolderPair => "folder pair",
        ItemMode::SelectedFiles => "selected files",
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes == 0 {
        return "0 B".to_owned();
    }
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

fn format_eta(seconds: u64) -> String {
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    format!("{h}:{m:02}:{s:02}")
}
