//! FlowTick domain library: hierarchical checklist progress for tracked regions of a
//! Markdown document.
//! The aggregation core is pure; loading, settings and refresh plumbing live in their
//! own modules so a host can reuse only what it needs.

pub mod core {
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------- Keys ------------------------------- */

    /// Identity of a forest node: the line of a real item, or the parent identifier a
    /// synthetic root was grouped under.
    pub type NodeKey = i64;

    /// Task marker of a completed checkbox (`- [x]`). Case-sensitive.
    pub const DONE_MARKER: &str = "x";

    /* ----------------------------- List items ----------------------------- */

    /// One list item as reported by the host's Markdown engine.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(from = "ListItemRecord", into = "ListItemRecord")]
    pub struct RawListItem {
        /// Line the item starts on.
        pub line: u32,
        /// Line of the owning item, or a negative value when the item sits directly
        /// under a document-level root.
        pub parent: i64,
        pub task: Option<String>,
    }

    impl RawListItem {
        pub fn new(line: u32, parent: i64, task: Option<&str>) -> Self {
            Self {
                line,
                parent,
                task: task.map(str::to_string),
            }
        }

        pub fn key(&self) -> NodeKey {
            NodeKey::from(self.line)
        }

        pub fn is_done(&self) -> bool {
            self.task.as_deref() == Some(DONE_MARKER)
        }
    }

    /// Wire shape of a list item in the host's metadata cache.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ListItemRecord {
        pub position: Pos,
        pub parent: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub task: Option<String>,
    }

    impl From<ListItemRecord> for RawListItem {
        fn from(record: ListItemRecord) -> Self {
            Self {
                line: record.position.start.line,
                parent: record.parent,
                task: record.task,
            }
        }
    }

    impl From<RawListItem> for ListItemRecord {
        fn from(item: RawListItem) -> Self {
            let at = Loc {
                line: item.line,
                ..Loc::default()
            };
            Self {
                position: Pos { start: at, end: at },
                parent: item.parent,
                task: item.task,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Pos {
        pub start: Loc,
        #[serde(default)]
        pub end: Loc,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Loc {
        pub line: u32,
        #[serde(default)]
        pub col: u32,
        #[serde(default)]
        pub offset: u32,
    }

    /* ------------------------------ Sections ------------------------------ */

    /// A top-level block of the document (paragraph, list, code fence, ...).
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SectionCache {
        #[serde(rename = "type")]
        pub kind: String,
        pub position: Pos,
    }

    impl SectionCache {
        pub fn code(start: u32, end: u32) -> Self {
            Self {
                kind: "code".to_string(),
                position: Pos {
                    start: Loc {
                        line: start,
                        ..Loc::default()
                    },
                    end: Loc {
                        line: end,
                        ..Loc::default()
                    },
                },
            }
        }

        pub fn is_code(&self) -> bool {
            self.kind == "code"
        }

        pub fn start_line(&self) -> u32 {
            self.position.start.line
        }
    }

    /// Per-file metadata produced by the host engine.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct FileCache {
        #[serde(default)]
        pub list_items: Vec<RawListItem>,
        #[serde(default)]
        pub sections: Vec<SectionCache>,
    }

    /* ------------------------------- Ranges ------------------------------- */

    /// Half-open line interval `[start, end)`. An unset bound leaves that side open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LineRange {
        pub start: Option<u32>,
        pub end: Option<u32>,
    }

    impl LineRange {
        pub const ALL: Self = Self {
            start: None,
            end: None,
        };

        pub fn new(start: Option<u32>, end: Option<u32>) -> Self {
            Self { start, end }
        }

        pub fn contains(&self, line: u32) -> bool {
            let after_start = self.start.is_none_or(|start| line >= start);
            let before_end = self.end.is_none_or(|end| line < end);
            after_start && before_end
        }
    }

    impl fmt::Display for LineRange {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if let Some(start) = self.start {
                write!(f, "{start}")?;
            }
            f.write_str("..")?;
            if let Some(end) = self.end {
                write!(f, "{end}")?;
            }
            Ok(())
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum SettingsError {
        #[error("unsupported color mode `{0}`")]
        UnsupportedColorMode(String),
        #[error("refresh interval must be greater than zero")]
        ZeroRefreshInterval,
        #[error("invalid settings: {0}")]
        Parse(#[from] serde_json::Error),
    }

}

pub mod checklist {
    //! Checklist aggregation.
    //!
    //! - [`filter_in_range`] picks the items of one tracked range, keeping input order.
    //! - [`Forest::build`] links items to their parents in a single pass. A parent identity
    //!   never seen as an item gets a synthetic root that only aggregates.
    //! - [`Forest::completion_rate`] folds the forest bottom-up: a leaf is 1 when its task
    //!   is `x`, an inner node is the plain mean of its direct children, and the result
    //!   is the mean over roots (0 for an empty forest).

    use crate::core::*;
    use crate::progress::Progress;
    use indexmap::IndexMap;
    use log::{debug, trace};
    use std::collections::HashMap;

    /* ------------------------------ Filtering ------------------------------ */

    pub fn filter_in_range(items: &[RawListItem], range: LineRange) -> Vec<&RawListItem> {
        items.iter().filter(|item| range.contains(item.line)).collect()
    }

    /* ------------------------------- Forest ------------------------------- */

    type NodeId = usize;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ListItemNode<'a> {
        /// `None` for synthetic roots.
        pub item: Option<&'a RawListItem>,
        pub line: NodeKey,
        id: NodeId,
        children: IndexMap<NodeKey, NodeId>,
    }

    impl<'a> ListItemNode<'a> {
        fn synthetic(key: NodeKey, id: NodeId) -> Self {
            Self {
                item: None,
                line: key,
                id,
                children: IndexMap::new(),
            }
        }

        fn from_item(item: &'a RawListItem, id: NodeId) -> Self {
            Self {
                item: Some(item),
                line: item.key(),
                id,
                children: IndexMap::new(),
            }
        }

        pub fn task(&self) -> Option<&'a str> {
            self.item.and_then(|item| item.task.as_deref())
        }

        pub fn is_synthetic(&self) -> bool {
            self.item.is_none()
        }

        pub fn child_count(&self) -> usize {
            self.children.len()
        }

        pub fn child_keys(&self) -> impl Iterator<Item = NodeKey> + '_ {
            self.children.keys().copied()
        }
    }

    /// Parent/child forest over one snapshot of list items. Immutable once built.
    #[derive(Debug, Clone, Default)]
    pub struct Forest<'a> {
        nodes: Vec<ListItemNode<'a>>,
        roots: IndexMap<NodeKey, NodeId>,
        /// Completion per node, indexed like `nodes`.
        rates: Vec<f64>,
    }

    impl<'a> Forest<'a> {
        /// Line identities are assumed unique; a repeated identity replaces the earlier
        /// node as the attachment point for later items.
        pub fn build(items: impl IntoIterator<Item = &'a RawListItem>) -> Self {
            let mut nodes: Vec<ListItemNode<'a>> = Vec::new();
            let mut roots = IndexMap::new();
            let mut all: HashMap<NodeKey, NodeId> = HashMap::new();

            for item in items {
                let parent_id = match all.get(&item.parent) {
                    Some(&id) => id,
                    None => {
                        let id = nodes.len();
                        nodes.push(ListItemNode::synthetic(item.parent, id));
                        roots.insert(item.parent, id);
                        all.insert(item.parent, id);
                        trace!("synthetic root {} opened by line {}", item.parent, item.line);
                        id
                    }
                };

                let id = nodes.len();
                nodes.push(ListItemNode::from_item(item, id));
                nodes[parent_id].children.insert(item.key(), id);
                all.insert(item.key(), id);
            }

            let rates = fold_completions(&nodes);
            Self {
                nodes,
                roots,
                rates,
            }
        }

        pub fn is_empty(&self) -> bool {
            self.roots.is_empty()
        }

        /// Number of nodes, synthetic roots included.
        pub fn len(&self) -> usize {
            self.nodes.len()
        }

        pub fn roots(&self) -> impl Iterator<Item = &ListItemNode<'a>> + '_ {
            self.roots.values().map(|&id| &self.nodes[id])
        }

        pub fn root(&self, key: NodeKey) -> Option<&ListItemNode<'a>> {
            self.roots.get(&key).map(|&id| &self.nodes[id])
        }

        pub fn children<'f>(
            &'f self,
            node: &'f ListItemNode<'a>,
        ) -> impl Iterator<Item = &'f ListItemNode<'a>> + 'f {
            node.children.values().map(|&id| &self.nodes[id])
        }

        pub fn child(&self, node: &ListItemNode<'a>, key: NodeKey) -> Option<&ListItemNode<'a>> {
            node.children.get(&key).map(|&id| &self.nodes[id])
        }

        /// Completion of one node of this forest in `[0, 1]`.
        pub fn completion(&self, node: &ListItemNode<'a>) -> f64 {
            self.rates.get(node.id).copied().unwrap_or(0.0)
        }

        /// Mean completion over the roots; an empty forest is 0.
        pub fn completion_rate(&self) -> f64 {
            if self.roots.is_empty() {
                return 0.0;
            }
            let sum: f64 = self.roots().map(|root| self.completion(root)).sum();
            sum / self.roots.len() as f64
        }
    }

    /// Bottom-up fold without recursion, so nesting depth is unbounded. A child is
    /// always pushed after its parent, hence a reverse sweep sees children first.
    fn fold_completions(nodes: &[ListItemNode<'_>]) -> Vec<f64> {
        let mut rates = vec![0.0; nodes.len()];
        for (id, node) in nodes.iter().enumerate().rev() {
            let rate = if node.children.is_empty() {
                if node.task() == Some(DONE_MARKER) {
                    1.0
                } else {
                    0.0
                }
            } else {
                let sum: f64 = node.children.values().map(|&child| rates[child]).sum();
                sum / node.children.len() as f64
            };
            rates[id] = rate;
        }
        rates
    }

    pub fn build_forest<'a>(items: impl IntoIterator<Item = &'a RawListItem>) -> Forest<'a> {
        Forest::build(items)
    }

    pub fn completion_rate<'a>(items: impl IntoIterator<Item = &'a RawListItem>) -> f64 {
        Forest::build(items).completion_rate()
    }

    /* ------------------------------ Analyzer ------------------------------ */

    /// Range-scoped view over the list items of one document snapshot.
    #[derive(Debug, Clone, Copy)]
    pub struct ChecklistAnalyzer<'a> {
        items: &'a [RawListItem],
    }

    impl<'a> ChecklistAnalyzer<'a> {
        pub fn new(items: &'a [RawListItem]) -> Self {
            Self { items }
        }

        /// A missing cache (no active document) behaves like an empty one.
        pub fn from_cache(cache: Option<&'a FileCache>) -> Self {
            Self::new(cache.map(|c| c.list_items.as_slice()).unwrap_or(&[]))
        }

        pub fn items_in_range(&self, range: LineRange) -> Vec<&'a RawListItem> {
            filter_in_range(self.items, range)
        }

        pub fn completion_rate(&self, range: LineRange) -> f64 {
            completion_rate(self.items_in_range(range))
        }

        pub fn progress(&self, range: LineRange) -> Progress {
            let in_range = self.items_in_range(range);
            let count = in_range.len();
            let progress = Progress::from_rate(completion_rate(in_range));
            debug!("range {range}: {count} items, progress {progress}");
            progress
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn item(line: u32, parent: i64, task: Option<&str>) -> RawListItem {
            RawListItem::new(line, parent, task)
        }

        #[test]
        fn filter_keeps_start_and_drops_end() {
            let items = vec![item(5, -5, None), item(10, -5, None), item(15, -5, None)];
            let lines = |range| {
                filter_in_range(&items, range)
                    .iter()
                    .map(|i| i.line)
                    .collect::<Vec<_>>()
            };
            assert_eq!(lines(LineRange::new(Some(5), Some(15))), vec![5, 10]);
            assert_eq!(lines(LineRange::ALL), vec![5, 10, 15]);
            assert_eq!(lines(LineRange::new(Some(11), None)), vec![15]);
            assert_eq!(lines(LineRange::new(None, Some(5))), Vec::<u32>::new());
        }

        #[test]
        fn filter_preserves_input_order() {
            let items = vec![item(9, -1, None), item(2, -1, None), item(6, -1, None)];
            let lines: Vec<u32> = filter_in_range(&items, LineRange::ALL)
                .iter()
                .map(|i| i.line)
                .collect();
            assert_eq!(lines, vec![9, 2, 6]);
        }

        #[test]
        fn empty_input_has_no_roots_and_zero_rate() {
            let none: Vec<RawListItem> = Vec::new();
            let forest = Forest::build(&none);
            assert!(forest.is_empty());
            assert_eq!(forest.completion_rate(), 0.0);
            assert_eq!(completion_rate(&none), 0.0);
        }

        #[test]
        fn leaf_rule_counts_only_x() {
            assert_eq!(completion_rate(&[item(0, -1, Some("x"))]), 1.0);
            assert_eq!(completion_rate(&[item(0, -1, None)]), 0.0);
            assert_eq!(completion_rate(&[item(0, -1, Some(" "))]), 0.0);
            assert_eq!(completion_rate(&[item(0, -1, Some("X"))]), 0.0);
        }

        #[test]
        fn builder_nests_items_under_their_parent_lines() {
            let items = vec![
                item(1, -1, None),
                item(2, 1, Some("x")),
                item(3, 2, Some(" ")),
                item(4, 1, None),
            ];
            let forest = Forest::build(&items);
            assert_eq!(forest.len(), 5);

            let root = forest.root(-1).expect("root -1");
            assert!(root.is_synthetic());
            assert_eq!(root.task(), None);
            assert_eq!(root.child_keys().collect::<Vec<_>>(), vec![1]);

            let first = forest.child(root, 1).expect("line 1");
            let mut keys: Vec<_> = first.child_keys().collect();
            keys.sort();
            assert_eq!(keys, vec![2, 4]);

            let second = forest.child(first, 2).expect("line 2");
            assert_eq!(second.task(), Some("x"));
            assert_eq!(second.child_count(), 1);
        }

        #[test]
        fn every_item_is_reachable_from_exactly_one_root() {
            let items = vec![
                item(0, -1, None),
                item(1, 0, None),
                item(2, 1, Some("x")),
                item(5, -5, None),
                item(6, 5, None),
            ];
            let forest = Forest::build(&items);

            fn collect<'f, 'a>(forest: &'f Forest<'a>, node: &'f ListItemNode<'a>, out: &mut Vec<i64>) {
                for child in forest.children(node) {
                    out.push(child.line);
                    collect(forest, child, out);
                }
            }

            let mut seen = Vec::new();
            for root in forest.roots() {
                collect(&forest, root, &mut seen);
            }
            seen.sort();
            assert_eq!(seen, vec![0, 1, 2, 5, 6]);
            assert_eq!(forest.roots().count(), 2);
        }

        #[test]
        fn nested_children_are_folded_before_averaging() {
            // root -> line 0 -> { 1: done, 2 -> { 3: done, 4: done } }
            let items = vec![
                item(0, -1, None),
                item(1, 0, Some("x")),
                item(2, 0, None),
                item(3, 2, Some("x")),
                item(4, 2, Some("x")),
            ];
            assert_eq!(completion_rate(&items), 1.0);
        }

        #[test]
        fn averages_children_instead_of_weighting_leaves() {
            // line 0 -> { 1: done, 2 -> { 3: done, 4: open } }
            let items = vec![
                item(0, -1, None),
                item(1, 0, Some("x")),
                item(2, 0, None),
                item(3, 2, Some("x")),
                item(4, 2, Some(" ")),
            ];
            let forest = Forest::build(&items);
            let root = forest.root(-1).expect("root");
            let top = forest.child(root, 0).expect("line 0");
            assert_eq!(forest.completion(top), 0.75);
            assert_eq!(forest.completion_rate(), 0.75);
        }

        #[test]
        fn single_half_done_child_matches_two_half_done_children() {
            let one = vec![
                item(0, -1, None),
                item(1, 0, None),
                item(2, 1, Some("x")),
                item(3, 1, None),
            ];
            let two = vec![
                item(0, -1, None),
                item(1, 0, None),
                item(2, 1, Some("x")),
                item(3, 1, None),
                item(4, 0, None),
                item(5, 4, Some("x")),
                item(6, 4, None),
            ];
            assert_eq!(completion_rate(&one), 0.5);
            assert_eq!(completion_rate(&two), 0.5);
        }

        #[test]
        fn deep_chain_folds_without_exhausting_the_stack() {
            let depth: u32 = 100_000;
            let mut items = vec![item(0, -1, None)];
            for line in 1..depth {
                let task = if line == depth - 1 { Some("x") } else { None };
                items.push(item(line, i64::from(line) - 1, task));
            }
            let forest = Forest::build(&items);
            assert_eq!(forest.len(), depth as usize + 1);
            assert_eq!(forest.completion_rate(), 1.0);
            assert_eq!(completion_rate(&items), 1.0);
        }

        #[test]
        fn duplicate_line_under_same_parent_replaces_earlier_node() {
            let items = vec![item(1, -1, Some("x")), item(1, -1, None)];
            let forest = Forest::build(&items);
            let root = forest.root(-1).expect("root");
            assert_eq!(root.child_count(), 1);
            assert_eq!(forest.child(root, 1).and_then(|n| n.task()), None);
            assert_eq!(forest.completion_rate(), 0.0);
        }

        #[test]
        fn independent_root_groups_each_count_once() {
            let items = vec![
                item(0, -1, Some("x")),
                item(1, -1, Some("x")),
                item(2, -1, Some("x")),
                item(10, -10, None),
            ];
            let forest = Forest::build(&items);
            assert_eq!(forest.roots().count(), 2);
            assert_eq!(forest.completion_rate(), 0.5);
        }

        #[test]
        fn parent_outside_range_becomes_a_synthetic_root() {
            let items = vec![
                item(0, -1, None),
                item(1, 0, Some("x")),
                item(2, 0, None),
            ];
            let in_range = filter_in_range(&items, LineRange::new(Some(1), None));
            let forest = Forest::build(in_range);
            let root = forest.root(0).expect("root keyed by parent line");
            assert!(root.is_synthetic());
            assert_eq!(root.line, 0);
            assert_eq!(forest.completion_rate(), 0.5);
        }

        #[test]
        fn child_listed_before_parent_keeps_its_own_root() {
            let items = vec![item(2, 1, Some("x")), item(1, -1, None)];
            let forest = Forest::build(&items);
            assert_eq!(forest.roots().count(), 2);
            // root 1 holds the done child; root -1 holds the childless, open line 1
            assert_eq!(forest.completion_rate(), 0.5);
        }

        #[test]
        fn rate_is_idempotent_and_leaves_input_untouched() {
            let items = vec![
                item(0, -1, None),
                item(1, 0, Some("x")),
                item(2, 0, None),
                item(3, -3, Some("x")),
            ];
            let snapshot = items.clone();
            let first = completion_rate(&items);
            let second = completion_rate(&items);
            assert_eq!(first, second);
            assert_eq!(items, snapshot);
            assert!((0.0..=1.0).contains(&first));
        }

        #[test]
        fn analyzer_without_cache_reports_zero() {
            let analyzer = ChecklistAnalyzer::from_cache(None);
            assert!(analyzer.items_in_range(LineRange::ALL).is_empty());
            assert_eq!(analyzer.progress(LineRange::ALL).percent(), 0);
        }

        #[test]
        fn analyzer_rounds_rate_to_percentage() {
            let items = vec![
                item(0, -1, Some("x")),
                item(1, -1, None),
                item(2, -1, None),
                item(20, -20, Some("x")),
            ];
            let analyzer = ChecklistAnalyzer::new(&items);
            // one of three leaves under a single root
            assert_eq!(analyzer.progress(LineRange::new(None, Some(20))).percent(), 33);
            // (1/3 + 1) / 2
            assert_eq!(analyzer.progress(LineRange::ALL).percent(), 67);
        }
    }
}

pub mod progress {
    //! Presentation of a completion rate: integer percentage, tier and bar color.

    use crate::core::SettingsError;
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};

    /// Integer percentage in `[0, 100]`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Progress(u8);

    impl Progress {
        pub const ZERO: Self = Self(0);
        pub const FULL: Self = Self(100);

        pub fn new(percent: u8) -> Self {
            Self(percent.min(100))
        }

        /// `round(rate * 100)`, clamped. A non-finite rate maps to 0.
        pub fn from_rate(rate: f64) -> Self {
            if !rate.is_finite() {
                return Self::ZERO;
            }
            Self((rate * 100.0).round().clamp(0.0, 100.0) as u8)
        }

        pub fn percent(self) -> u8 {
            self.0
        }

        pub fn tier(self) -> ProgressTier {
            ProgressTier::classify(self)
        }
    }

    impl fmt::Display for Progress {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}%", self.0)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum ProgressTier {
        LowOrNone,
        InProgress,
        Complete,
    }

    impl ProgressTier {
        pub fn classify(progress: Progress) -> Self {
            match progress.percent() {
                100.. => ProgressTier::Complete,
                21..=99 => ProgressTier::InProgress,
                _ => ProgressTier::LowOrNone,
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                ProgressTier::LowOrNone => "low-or-none",
                ProgressTier::InProgress => "in-progress",
                ProgressTier::Complete => "complete",
            }
        }
    }

    impl fmt::Display for ProgressTier {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /* ------------------------------ Colors ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum ColorMode {
        /// 0-20 red, 21-99 green, 100 blue.
        #[default]
        Default,
    }

    impl ColorMode {
        pub fn color(self, tier: ProgressTier) -> &'static str {
            match (self, tier) {
                (ColorMode::Default, ProgressTier::Complete) => "var(--color-blue)",
                (ColorMode::Default, ProgressTier::InProgress) => "var(--color-green)",
                (ColorMode::Default, ProgressTier::LowOrNone) => "var(--color-red)",
            }
        }
    }

    impl fmt::Display for ColorMode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                ColorMode::Default => f.write_str("default"),
            }
        }
    }

    impl FromStr for ColorMode {
        type Err = SettingsError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s {
                "default" => Ok(ColorMode::Default),
                other => Err(SettingsError::UnsupportedColorMode(other.to_string())),
            }
        }
    }

    pub fn progress_color(progress: Progress, mode: ColorMode) -> &'static str {
        mode.color(progress.tier())
    }

    /// Inline style of the bar's fill element.
    pub fn bar_style(progress: Progress, mode: ColorMode) -> String {
        format!(
            "width:{}%; background:{};",
            progress.percent(),
            progress_color(progress, mode)
        )
    }

}

pub mod blocks {
    //! Tracked blocks: ```` ```flowtick ```` fences that each measure the list items
    //! between themselves and the next fence.

    use crate::checklist::ChecklistAnalyzer;
    use crate::core::*;
    use crate::progress::{ColorMode, Progress, ProgressTier, bar_style};
    use log::debug;
    use nom::{
        IResult,
        bytes::complete::{tag, tag_no_case},
        sequence::pair,
    };
    use serde::Serialize;
    use uuid::Uuid;

    pub const CODE_FENCE: &str = "```";
    pub const BLOCK_TAG: &str = "flowtick";

    fn tracked_fence(i: &str) -> IResult<&str, (&str, &str)> {
        pair(tag(CODE_FENCE), tag_no_case(BLOCK_TAG))(i)
    }

    /// Whether a fence line opens a tracked block. Anything may follow the tag.
    pub fn is_tracked_fence(line: &str) -> bool {
        tracked_fence(line.trim()).is_ok()
    }

    /// Start lines of tracked blocks among the document's code sections, ascending.
    pub fn tracked_block_starts(sections: &[SectionCache], document: &str) -> Vec<u32> {
        let lines: Vec<&str> = document.lines().collect();
        let mut starts: Vec<u32> = sections
            .iter()
            .filter(|section| section.is_code())
            .map(SectionCache::start_line)
            .filter(|&line| {
                lines
                    .get(line as usize)
                    .is_some_and(|text| is_tracked_fence(text))
            })
            .collect();
        starts.sort_unstable();
        starts.dedup();
        starts
    }

    /// Each block measures up to the next block's start; the last one is open-ended.
    pub fn block_ranges(starts: &[u32]) -> Vec<LineRange> {
        let mut sorted = starts.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted
            .iter()
            .map(|&start| LineRange::new(Some(start), range_end_for(start, &sorted)))
            .collect()
    }

    /// End line for the block starting at `start`: the next tracked start after it.
    pub fn range_end_for(start: u32, starts: &[u32]) -> Option<u32> {
        starts.iter().copied().filter(|&s| s > start).min()
    }

    /* ------------------------------ Tracker ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TrackedBlock {
        pub id: Uuid,
        pub range: LineRange,
    }

    impl TrackedBlock {
        fn new(range: LineRange) -> Self {
            Self {
                id: Uuid::new_v4(),
                range,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct BlockReport {
        pub id: Uuid,
        pub range: LineRange,
        pub progress: Progress,
        pub tier: ProgressTier,
        pub style: String,
    }

    /// Registry of the tracked blocks of one document, kept aligned with edits.
    #[derive(Debug, Clone, Default)]
    pub struct BlockTracker {
        blocks: Vec<TrackedBlock>,
    }

    impl BlockTracker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn blocks(&self) -> &[TrackedBlock] {
            &self.blocks
        }

        /// Re-align blocks to freshly discovered starts, matching them by position.
        /// Returns true if any block was added, removed or moved.
        pub fn sync(&mut self, starts: &[u32]) -> bool {
            let ranges = block_ranges(starts);
            let mut changed = ranges.len() != self.blocks.len();
            self.blocks.truncate(ranges.len());

            for (idx, range) in ranges.into_iter().enumerate() {
                match self.blocks.get_mut(idx) {
                    Some(block) if block.range == range => {}
                    Some(block) => {
                        debug!("block {} moved {} -> {}", block.id, block.range, range);
                        block.range = range;
                        changed = true;
                    }
                    None => {
                        let block = TrackedBlock::new(range);
                        debug!("block {} registered at {}", block.id, block.range);
                        self.blocks.push(block);
                    }
                }
            }
            changed
        }

        pub fn report(&self, items: &[RawListItem], mode: ColorMode) -> Vec<BlockReport> {
            let analyzer = ChecklistAnalyzer::new(items);
            self.blocks
                .iter()
                .map(|block| {
                    let progress = analyzer.progress(block.range);
                    BlockReport {
                        id: block.id,
                        range: block.range,
                        progress,
                        tier: progress.tier(),
                        style: bar_style(progress, mode),
                    }
                })
                .collect()
        }
    }

}

pub mod settings {
    use crate::core::SettingsError;
    use crate::progress::ColorMode;
    use anyhow::{Context, Result};
    use log::LevelFilter;
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, DurationMilliSeconds, serde_as};
    use std::{fs, path::Path, time::Duration};

    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(1000);

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Settings {
        /// How often tracked blocks are re-measured (milliseconds on disk).
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        pub refresh_interval: Duration,
        #[serde_as(as = "DisplayFromStr")]
        pub color_mode: ColorMode,
        pub debug: bool,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                refresh_interval: DEFAULT_REFRESH_INTERVAL,
                color_mode: ColorMode::Default,
                debug: false,
            }
        }
    }

    impl Settings {
        pub fn from_json(text: &str) -> Result<Self, SettingsError> {
            let settings: Settings = serde_json::from_str(text)?;
            settings.validate()?;
            Ok(settings)
        }

        /// Load from a JSON file, falling back to defaults for missing keys.
        pub fn load(path: &Path) -> Result<Self> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading settings {:?}", path))?;
            Self::from_json(&text).with_context(|| format!("loading settings {:?}", path))
        }

        pub fn validate(&self) -> Result<(), SettingsError> {
            if self.refresh_interval.is_zero() {
                return Err(SettingsError::ZeroRefreshInterval);
            }
            Ok(())
        }

        pub fn log_level(&self, verbose: bool) -> LevelFilter {
            if verbose || self.debug {
                LevelFilter::Debug
            } else {
                LevelFilter::Warn
            }
        }
    }

}

pub mod storage {
    //! Loading of host snapshots: the metadata cache (JSON) and the document text.

    use crate::core::{FileCache, RawListItem};
    use anyhow::{Context, Result};
    use serde::Deserialize;
    use std::{fs, path::Path};

    /// Either a full file cache or a bare array of list items.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CacheInput {
        Cache(FileCache),
        Items(Vec<RawListItem>),
    }

    pub fn parse_file_cache(text: &str) -> Result<FileCache> {
        let input: CacheInput = serde_json::from_str(text).context("parsing file cache")?;
        Ok(match input {
            CacheInput::Cache(cache) => cache,
            CacheInput::Items(list_items) => FileCache {
                list_items,
                sections: Vec::new(),
            },
        })
    }

    pub fn load_file_cache(path: &Path) -> Result<FileCache> {
        let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        parse_file_cache(&text).with_context(|| format!("loading cache {:?}", path))
    }

    pub fn load_document(path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
    }

}

pub mod refresh {
    //! Refresh plumbing: one cycle at a time, and re-render only on change.

    use crate::blocks::{BlockReport, BlockTracker, tracked_block_starts};
    use crate::core::FileCache;
    use crate::progress::{ColorMode, Progress};
    use log::debug;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    /// Admits at most one refresh cycle; a trigger while a cycle runs is dropped.
    #[derive(Debug, Default)]
    pub struct RefreshGate {
        active: AtomicBool,
    }

    /// Held for the duration of a cycle.
    #[derive(Debug)]
    pub struct RefreshCycle<'a> {
        gate: &'a RefreshGate,
    }

    impl RefreshGate {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn try_begin(&self) -> Option<RefreshCycle<'_>> {
            self.active
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .ok()
                .map(|_| RefreshCycle { gate: self })
        }

        pub fn is_active(&self) -> bool {
            self.active.load(Ordering::Acquire)
        }
    }

    impl Drop for RefreshCycle<'_> {
        fn drop(&mut self) {
            self.gate.active.store(false, Ordering::Release);
        }
    }

    /// Last rendered progress per block; every block starts at 0.
    #[derive(Debug, Clone, Default)]
    pub struct ProgressTracker {
        rendered: HashMap<Uuid, Progress>,
    }

    impl ProgressTracker {
        pub fn new() -> Self {
            Self::default()
        }

        /// Records `progress` and returns it if it differs from the last one seen.
        pub fn observe(&mut self, id: Uuid, progress: Progress) -> Option<Progress> {
            let previous = self.rendered.get(&id).copied().unwrap_or(Progress::ZERO);
            if previous == progress {
                return None;
            }
            self.rendered.insert(id, progress);
            Some(progress)
        }

        pub fn last(&self, id: Uuid) -> Progress {
            self.rendered.get(&id).copied().unwrap_or(Progress::ZERO)
        }

        pub fn forget_except(&mut self, live: &[Uuid]) {
            self.rendered.retain(|id, _| live.contains(id));
        }
    }

    /// Tracked blocks of one document plus what was last rendered for them.
    #[derive(Debug, Clone, Default)]
    pub struct Session {
        blocks: BlockTracker,
        rendered: ProgressTracker,
    }

    impl Session {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn blocks(&self) -> &BlockTracker {
            &self.blocks
        }

        /// Re-sync block ranges against the snapshot and return the blocks whose
        /// progress changed since the last cycle.
        pub fn refresh(
            &mut self,
            cache: &FileCache,
            document: &str,
            mode: ColorMode,
        ) -> Vec<BlockReport> {
            let starts = tracked_block_starts(&cache.sections, document);
            if self.blocks.sync(&starts) {
                debug!("tracked blocks now at {:?}", starts);
                let live: Vec<Uuid> = self.blocks.blocks().iter().map(|b| b.id).collect();
                self.rendered.forget_except(&live);
            }

            self.blocks
                .report(&cache.list_items, mode)
                .into_iter()
                .filter(|report| self.rendered.observe(report.id, report.progress).is_some())
                .collect()
        }
    }

}

pub use checklist::{ChecklistAnalyzer, Forest, build_forest, completion_rate, filter_in_range};
pub use progress::{ColorMode, Progress, ProgressTier};
pub use settings::Settings;
