//! Diff rendering for generation previews.

use std::fmt::{self, Write as _};

use similar::{ChangeTag, TextDiff};

/// Unchanged lines shown around each change.
const CONTEXT_LINES: usize = 1;

/// Lines added and removed between two texts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
}

impl DiffStats {
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

impl fmt::Display for DiffStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{} -{}", self.added, self.removed)
    }
}

/// Render `original` → `proposed` as numbered lines marked ` `, `-` or `+`.
///
/// Removed and unchanged lines carry their number in `original`, added lines
/// their number in `proposed`. Hunks are separated by a `...` line. Identical
/// texts render as an empty string.
#[must_use]
pub fn format_preview_diff(original: &str, proposed: &str) -> String {
    let diff = TextDiff::from_lines(original, proposed);
    let width = line_number_width(original, proposed);
    let mut out = String::new();

    for (index, group) in diff.grouped_ops(CONTEXT_LINES).iter().enumerate() {
        if index > 0 {
            let _ = writeln!(out, "{:>width$}", "...");
        }
        for op in group {
            for change in diff.iter_changes(op) {
                let (line, marker) = match change.tag() {
                    ChangeTag::Equal => (change.old_index(), ' '),
                    ChangeTag::Delete => (change.old_index(), '-'),
                    ChangeTag::Insert => (change.new_index(), '+'),
                };
                let line = line.map_or(0, |n| n + 1);
                let text = change.value().trim_end_matches(['\n', '\r']);
                let _ = writeln!(out, "{line:>width$} {marker}{text}");
            }
        }
    }

    out
}

#[must_use]
pub fn diff_stats(original: &str, proposed: &str) -> DiffStats {
    TextDiff::from_lines(original, proposed)
        .iter_all_changes()
        .fold(DiffStats::default(), |mut stats, change| {
            match change.tag() {
                ChangeTag::Insert => stats.added += 1,
                ChangeTag::Delete => stats.removed += 1,
                ChangeTag::Equal => {}
            }
            stats
        })
}

fn line_number_width(original: &str, proposed: &str) -> usize {
    let lines = original.lines().count().max(proposed.lines().count()).max(1);
    lines.to_string().len()
}
