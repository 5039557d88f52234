//! Line-level text diff producing added/deleted fragments.
//!
//! Lines are aligned with Myers' algorithm. Lines that only moved are
//! cancelled out, and a hunk that replaces N lines with N lines is refined at
//! word level so an in-line edit reports just the words that changed.
use std::collections::{HashMap, VecDeque};

use similar::{Algorithm, ChangeTag, DiffTag, TextDiff};
use thiserror::Error;

use crate::model::ChangeSet;

pub const DEFAULT_MAX_DIFF_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("content is not plain text (control character {0:?} at byte {1})")]
    NonText(char, usize),
    #[error("content is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    pub max_bytes: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_DIFF_BYTES,
        }
    }
}

/// Diff with default limits.
pub fn diff(old: &str, new: &str) -> Result<ChangeSet, DiffError> {
    diff_with(old, new, &DiffOptions::default())
}

pub fn diff_with(old: &str, new: &str, opts: &DiffOptions) -> Result<ChangeSet, DiffError> {
    check_text(old, opts)?;
    check_text(new, opts)?;
    if old == new {
        return Ok(ChangeSet::default());
    }
    // Align in a fixed orientation so diff(a, b) is always the mirror of diff(b, a).
    if old <= new {
        Ok(diff_lines(old, new))
    } else {
        Ok(diff_lines(new, old).mirrored())
    }
}

fn check_text(text: &str, opts: &DiffOptions) -> Result<(), DiffError> {
    if text.len() > opts.max_bytes {
        return Err(DiffError::TooLarge {
            size: text.len(),
            limit: opts.max_bytes,
        });
    }
    match text
        .char_indices()
        .find(|(_, c)| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\u{0B}' | '\u{0C}'))
    {
        Some((pos, c)) => Err(DiffError::NonText(c, pos)),
        None => Ok(()),
    }
}

#[derive(Debug, Default)]
struct Hunk {
    deleted: Vec<usize>,
    inserted: Vec<usize>,
}

impl Hunk {
    fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.inserted.is_empty()
    }
}

fn diff_lines(old: &str, new: &str) -> ChangeSet {
    let old_lines: Vec<&str> = old.lines().map(str::trim).collect();
    let new_lines: Vec<&str> = new.lines().map(str::trim).collect();

    let ops = similar::capture_diff_slices(Algorithm::Myers, &old_lines, &new_lines);
    let mut hunks = Vec::new();
    let mut current = Hunk::default();
    for op in &ops {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            if !current.is_empty() {
                hunks.push(std::mem::take(&mut current));
            }
            continue;
        }
        current
            .deleted
            .extend(old_range.filter(|&i| !old_lines[i].is_empty()));
        current
            .inserted
            .extend(new_range.filter(|&i| !new_lines[i].is_empty()));
    }
    if !current.is_empty() {
        hunks.push(current);
    }

    cancel_moves(&mut hunks, &old_lines, &new_lines);

    let mut out = ChangeSet::default();
    for hunk in &hunks {
        if hunk.deleted.len() == hunk.inserted.len() {
            for (&d, &i) in hunk.deleted.iter().zip(&hunk.inserted) {
                refine_words(old_lines[d], new_lines[i], &mut out);
            }
        } else {
            out.deleted
                .extend(hunk.deleted.iter().map(|&d| old_lines[d].to_string()));
            out.added
                .extend(hunk.inserted.iter().map(|&i| new_lines[i].to_string()));
        }
    }
    out
}

/// Drop line pairs where the same text was deleted in one place and inserted
/// in another. Earliest deletion pairs with earliest insertion.
fn cancel_moves(hunks: &mut [Hunk], old_lines: &[&str], new_lines: &[&str]) {
    let mut deleted_by_text: HashMap<&str, VecDeque<usize>> = HashMap::new();
    for hunk in hunks.iter() {
        for &d in &hunk.deleted {
            deleted_by_text.entry(old_lines[d]).or_default().push_back(d);
        }
    }

    let mut moved_old = Vec::new();
    let mut moved_new = Vec::new();
    for hunk in hunks.iter() {
        for &i in &hunk.inserted {
            if let Some(d) = deleted_by_text
                .get_mut(new_lines[i])
                .and_then(VecDeque::pop_front)
            {
                moved_old.push(d);
                moved_new.push(i);
            }
        }
    }
    if moved_old.is_empty() {
        return;
    }
    for hunk in hunks.iter_mut() {
        hunk.deleted.retain(|d| !moved_old.contains(d));
        hunk.inserted.retain(|i| !moved_new.contains(i));
    }
}

fn refine_words(old_line: &str, new_line: &str, out: &mut ChangeSet) {
    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_words(old_line, new_line);

    let mut added = String::new();
    let mut deleted = String::new();
    for change in diff.iter_all_changes() {
        let value = change.value();
        match change.tag() {
            ChangeTag::Insert => added.push_str(value),
            ChangeTag::Delete => deleted.push_str(value),
            ChangeTag::Equal if value.trim().is_empty() => {
                if !added.is_empty() {
                    added.push_str(value);
                }
                if !deleted.is_empty() {
                    deleted.push_str(value);
                }
            }
            ChangeTag::Equal => {
                flush(&mut added, &mut out.added);
                flush(&mut deleted, &mut out.deleted);
            }
        }
    }
    flush(&mut added, &mut out.added);
    flush(&mut deleted, &mut out.deleted);
}

fn flush(buf: &mut String, into: &mut Vec<String>) {
    let fragment = buf.trim();
    if !fragment.is_empty() {
        into.push(fragment.to_string());
    }
    buf.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(added: &[&str], deleted: &[&str]) -> ChangeSet {
        ChangeSet {
            added: added.iter().map(|s| s.to_string()).collect(),
            deleted: deleted.iter().map(|s| s.to_string()).collect(),
        }
    }

    const SAMPLES: &[&str] = &[
        "",
        "Hello",
        "Hello world",
        "a\nb\nc",
        "c\na\nb",
        "a\nb\nc\nd\ne",
        "a\nx\nc\nd",
        "the quick brown fox\njumps over\nthe lazy dog",
        "the slow brown fox\njumps over\nthe lazy cat\nand more",
        "x\nx\nx",
        "x",
        "  indented line\n\nsecond paragraph",
    ];

    #[test]
    fn identical_inputs_yield_empty_diff() {
        for text in SAMPLES {
            assert_eq!(diff(text, text).unwrap(), ChangeSet::default(), "{text:?}");
        }
    }

    #[test]
    fn diff_is_symmetric() {
        for a in SAMPLES {
            for b in SAMPLES {
                let forward = diff(a, b).unwrap();
                let backward = diff(b, a).unwrap();
                assert_eq!(forward.added, backward.deleted, "{a:?} -> {b:?}");
                assert_eq!(forward.deleted, backward.added, "{a:?} -> {b:?}");
            }
        }
    }

    #[test]
    fn diff_is_deterministic() {
        for a in SAMPLES {
            for b in SAMPLES {
                assert_eq!(diff(a, b).unwrap(), diff(a, b).unwrap());
            }
        }
    }

    #[test]
    fn empty_to_text_reports_everything_added() {
        assert_eq!(diff("", "a\nb").unwrap(), set(&["a", "b"], &[]));
        assert_eq!(diff("a\nb", "").unwrap(), set(&[], &["a", "b"]));
    }

    #[test]
    fn appended_word_reports_only_the_word() {
        assert_eq!(diff("Hello", "Hello world").unwrap(), set(&["world"], &[]));
    }

    #[test]
    fn replaced_word_reports_both_sides() {
        assert_eq!(
            diff("the quick fox", "the slow fox").unwrap(),
            set(&["slow"], &["quick"])
        );
    }

    #[test]
    fn reordered_lines_are_not_changes() {
        assert_eq!(diff("a\nb\nc", "c\na\nb").unwrap(), ChangeSet::default());
    }

    #[test]
    fn reorder_with_edit_reports_only_the_edit() {
        assert_eq!(
            diff("a\nb\nc", "b\na\nc changed").unwrap(),
            set(&["changed"], &[])
        );
    }

    #[test]
    fn inserted_line_between_unchanged_lines() {
        assert_eq!(diff("a\nc", "a\nb\nc").unwrap(), set(&["b"], &[]));
    }

    #[test]
    fn duplicate_lines_count_individually() {
        assert_eq!(diff("x\nx", "x").unwrap(), set(&[], &["x"]));
        assert_eq!(diff("x", "x\nx\nx").unwrap(), set(&["x", "x"], &[]));
    }

    #[test]
    fn blank_lines_are_not_fragments() {
        assert_eq!(diff("a", "a\n\n\nb").unwrap(), set(&["b"], &[]));
        assert_eq!(diff("a", "a\n   \n").unwrap(), ChangeSet::default());
    }

    #[test]
    fn rejects_binary_content() {
        let err = diff("ok", "bad\0data").unwrap_err();
        assert_eq!(err, DiffError::NonText('\0', 3));
    }

    #[test]
    fn rejects_oversized_content() {
        let opts = DiffOptions { max_bytes: 4 };
        let err = diff_with("abc", "abcdef", &opts).unwrap_err();
        assert_eq!(err, DiffError::TooLarge { size: 6, limit: 4 });
    }
}
