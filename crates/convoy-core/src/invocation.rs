//! Argument construction for the three invocation shapes.
//!
//! Every shape shares the tool's archive+update transfer semantics; they
//! differ only in what output they request. Source and destination are
//! always the final two positional arguments.

use crate::item::{ItemMode, ItemPair};
use crate::paths;

/// Archive + update-only: copy recursively, preserve metadata, never replace
/// a newer file at the destination.
const TRANSFER_SEMANTICS: &str = "-au";

/// A ready-to-spawn argument list plus the post-normalization endpoint
/// strings for display and logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub args: Vec<String>,
    pub source_shown: String,
    pub dest_shown: String,
}

/// Planning shape: no mutation, one `<byte-size>\t<relative-name>` line per
/// would-be-transferred entry, raw numbers only.
pub fn counting_dry_run(item: &ItemPair) -> Invocation {
    build(item, &["--dry-run", "--out-format=%l\t%n"])
}

/// Same transfer semantics plus a final machine-readable statistics block.
pub fn stats_dry_run(item: &ItemPair) -> Invocation {
    build(item, &["--dry-run", "--stats"])
}

/// The real transfer. Modern tool builds get the structured progress
/// protocol with raw numeric formatting; legacy builds only understand
/// per-file percent output.
pub fn transfer(item: &ItemPair, structured_progress: bool) -> Invocation {
    if structured_progress {
        build(item, &["--info=progress2", "--no-human-readable"])
    } else {
        build(item, &["--progress"])
    }
}

fn build(item: &ItemPair, shape_args: &[&str]) -> Invocation {
    let (source, dest) = resolved_endpoints(item);

    let mut args = vec![TRANSFER_SEMANTICS.to_string()];
    args.extend(shape_args.iter().map(|arg| (*arg).to_string()));
    args.extend(filter_args(item));
    args.push(source.clone());
    args.push(dest.clone());

    Invocation {
        args,
        source_shown: source,
        dest_shown: dest,
    }
}

fn resolved_endpoints(item: &ItemPair) -> (String, String) {
    let source = paths::normalize_folder_path(&item.source);
    let dest = match item.mode {
        ItemMode::FolderPair => {
            paths::folder_pair_destination(&item.target, item.source_folder_name())
        }
        ItemMode::SelectedFiles => paths::normalize_folder_path(&item.target),
    };
    (source, dest)
}

/// Restrict a `SelectedFiles` transfer to exactly the chosen files while
/// keeping directory traversal open so the tool can reach them: include all
/// directories, include each selection, exclude the rest.
fn filter_args(item: &ItemPair) -> Vec<String> {
    if item.mode != ItemMode::SelectedFiles {
        return Vec::new();
    }
    let selected = item.selected.as_deref().unwrap_or_default();

    let mut args = Vec::with_capacity(selected.len() + 2);
    args.push("--include=*/".to_string());
    for rel in selected {
        args.push(format!("--include={rel}"));
    }
    args.push("--exclude=*".to_string());
    args
}
