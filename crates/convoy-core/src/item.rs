//! The configured item-pair model and the per-run snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::paths;

/// Stable, opaque identity of a configured pair. Used as the aggregation key
/// for plan rows and the process table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a pair scopes its transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemMode {
    /// Mirror an entire folder into the target.
    FolderPair,
    /// Transfer only an explicit subset of files under the source base path.
    SelectedFiles,
}

/// One configured source/target pair. Immutable during a run; edits go
/// through the persisted store between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemPair {
    pub id: ItemId,
    pub mode: ItemMode,
    pub source: String,
    pub target: String,
    /// Relative paths below `source`; present only for `SelectedFiles`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<Vec<String>>,
}

impl ItemPair {
    pub fn folder(id: ItemId, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id,
            mode: ItemMode::FolderPair,
            source: source.into(),
            target: target.into(),
            selected: None,
        }
    }

    pub fn selected_files(
        id: ItemId,
        source: impl Into<String>,
        target: impl Into<String>,
        selected: Vec<String>,
    ) -> Self {
        Self {
            id,
            mode: ItemMode::SelectedFiles,
            source: source.into(),
            target: target.into(),
            selected: Some(selected),
        }
    }

    /// Name of the source folder itself, used for destination nesting.
    pub fn source_folder_name(&self) -> &str {
        paths::folder_name(&self.source)
    }
}

/// The item list captured at the instant a run starts. Concurrent edits to
/// the live list never reach an in-progress run.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    items: Vec<ItemPair>,
}

impl RunSnapshot {
    pub fn new(items: Vec<ItemPair>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[ItemPair] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Item ids in their original order; plan presentation always follows
    /// this, not scan completion order.
    pub fn order(&self) -> Vec<ItemId> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_folder_name_ignores_trailing_slash() {
        let item = ItemPair::folder(ItemId::new("a"), "/Users/kim/Photos/", "/Volumes/Backup");
        assert_eq!(item.source_folder_name(), "Photos");
    }

    #[test]
    fn snapshot_preserves_order() {
        let items = vec![
            ItemPair::folder(ItemId::new("b"), "/src/b", "/dst"),
            ItemPair::folder(ItemId::new("a"), "/src/a", "/dst"),
        ];
        let snapshot = RunSnapshot::new(items);
        let order: Vec<String> = snapshot.order().into_iter().map(|id| id.0).collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn item_pair_roundtrips_through_json() {
        let item = ItemPair::selected_files(
            ItemId::new("x"),
            "/Users/kim/Documents",
            "/Volumes/Backup/Documents",
            vec!["notes/today.md".to_string()],
        );
        let json = serde_json::to_string(&item).unwrap();
        let back: ItemPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, item.id);
        assert_eq!(back.mode, ItemMode::SelectedFiles);
        assert_eq!(back.selected.as_deref(), Some(&["notes/today.md".to_string()][..]));
    }
}
