//! Convergent line insertion: a promised line or block is added only when
//! it is not already present under the active whitespace policy.

use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

use super::file::EditFile;
use super::region::{Region, RegionAttrs, RegionFailure, select_region};
use super::select::{InsertMatchPolicy, LineSelect, line_matches, policies_consistent};
use super::{EditError, EditResult, full_match};
use crate::eval::vars::Bindings;
use crate::eval::EvalContext;
use crate::outcome::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum InsertType {
    #[default]
    Literal,
    PreserveAllLines,
    PreserveBlock,
    File,
    FilePreserveBlock,
}

impl InsertType {
    fn from_file(self) -> bool {
        matches!(self, InsertType::File | InsertType::FilePreserveBlock)
    }

    /// Block-preserving types skip the per-line presence test so a block
    /// keeps its internal order.
    fn preserves_block(self) -> bool {
        !matches!(self, InsertType::Literal | InsertType::File)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EditOrder {
    Before,
    #[default]
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FirstLast {
    First,
    #[default]
    Last,
}

#[derive(Debug, Clone, Default)]
pub struct LocationAttrs {
    pub before_after: EditOrder,
    pub first_last: FirstLast,
    pub line_matching: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InsertAttrs {
    pub insert_type: InsertType,
    pub match_policies: Vec<InsertMatchPolicy>,
    pub expand_scalars: bool,
    pub location: LocationAttrs,
    pub line_select: LineSelect,
    pub region: RegionAttrs,
}

/// Mutually contradictory attribute combinations fail before touching the
/// file.
fn sanity_check(attrs: &InsertAttrs) -> Result<(), String> {
    if !attrs.line_select.consistent() {
        return Err("line selection mixes positive and negative filters".to_string());
    }
    if !policies_consistent(&attrs.match_policies) {
        return Err("exact_match cannot be combined with ignore policies".to_string());
    }
    if attrs.insert_type.preserves_block()
        && attrs.insert_type != InsertType::PreserveAllLines
        && attrs
            .match_policies
            .iter()
            .any(|p| *p != InsertMatchPolicy::ExactMatch)
    {
        return Err("whitespace policies cannot be used with preserved blocks".to_string());
    }
    Ok(())
}

/// The lines to insert: the promiser itself, or the contents of the file it
/// names for the file-sourced insert types.
fn chunk_lines(
    ctx: &EvalContext,
    attrs: &InsertAttrs,
    promiser: &str,
) -> EditResult<Vec<String>> {
    if attrs.insert_type.from_file() {
        let content =
            std::fs::read_to_string(promiser).map_err(|source| EditError::Io {
                path: promiser.to_string(),
                source,
            })?;
        let bindings = Bindings::new();
        Ok(content
            .lines()
            .map(|line| {
                if attrs.expand_scalars {
                    ctx.expand_scalar(line, &bindings)
                } else {
                    line.to_string()
                }
            })
            .collect())
    } else {
        Ok(promiser.split('\n').map(str::to_string).collect())
    }
}

/// Does the chunk already appear as consecutive lines inside the region?
fn chunk_in_region(
    lines: &[String],
    region: Region,
    chunk: &[String],
    policies: &[InsertMatchPolicy],
) -> bool {
    if chunk.is_empty() {
        return true;
    }
    let (start, end) = region.bounds(lines.len());
    if end - start < chunk.len() {
        return false;
    }
    (start..=end - chunk.len()).any(|base| {
        chunk
            .iter()
            .enumerate()
            .all(|(offset, promised)| line_matches(promised, &lines[base + offset], policies))
    })
}

fn find_anchor(
    lines: &[String],
    region: Region,
    pattern: &str,
    first_last: FirstLast,
) -> EditResult<Option<usize>> {
    let (start, end) = region.bounds(lines.len());
    let mut found = None;
    for index in start..end {
        if full_match(pattern, &lines[index])? {
            found = Some(index);
            if first_last == FirstLast::First {
                break;
            }
        }
    }
    Ok(found)
}

/// Actuate one `insert_lines` promise against the in-memory file.
pub fn verify_line_insertions(
    file: &mut EditFile,
    ctx: &EvalContext,
    attrs: &InsertAttrs,
    promiser: &str,
) -> EditResult<Outcome> {
    if let Err(reason) = sanity_check(attrs) {
        warn!(promiser, "line insertion breaks its own promises: {reason}");
        return Ok(Outcome::Fail);
    }

    let chunk = chunk_lines(ctx, attrs, promiser)?;

    let region = if attrs.region.is_restricted() {
        match select_region(&file.lines, &attrs.region)? {
            Ok(region) => region,
            Err(failure) => {
                warn!(
                    promiser,
                    file = %file.path.display(),
                    "could not select an edit region ({failure:?})"
                );
                return Ok(Outcome::Interrupted);
            }
        }
    } else {
        Region::default()
    };

    // Where the chunk goes: relative to an anchor line, or to the region
    // boundary; an empty file is always prepended.
    let cursor = if file.is_empty() {
        0
    } else if let Some(pattern) = &attrs.location.line_matching {
        match find_anchor(&file.lines, region, pattern, attrs.location.first_last)? {
            Some(anchor) => match attrs.location.before_after {
                EditOrder::Before => anchor,
                EditOrder::After => anchor + 1,
            },
            None => {
                warn!(
                    promiser,
                    pattern, "could not select a locator matching the anchor regex"
                );
                return Ok(Outcome::Interrupted);
            }
        }
    } else {
        let (start, end) = region.bounds(file.len());
        match attrs.location.before_after {
            EditOrder::Before => start,
            EditOrder::After => end,
        }
    };

    let preserve_all = attrs.insert_type == InsertType::PreserveAllLines;
    if !preserve_all && chunk_in_region(&file.lines, region, &chunk, &attrs.match_policies) {
        debug!(promiser, "promised lines exist within selected region");
        return Ok(Outcome::Noop);
    }

    let mut cursor = cursor;
    let mut changed = false;
    for line in &chunk {
        if !attrs.line_select.selects(line)? {
            continue;
        }
        if !attrs.insert_type.preserves_block()
            && region_contains_line(&file.lines, region, line, &attrs.match_policies)
        {
            continue;
        }
        // Neighbour test: an equal line already sits at the target spot.
        match attrs.location.before_after {
            EditOrder::After => {
                if !attrs.insert_type.preserves_block()
                    && cursor < file.lines.len()
                    && line_matches(line, &file.lines[cursor], &attrs.match_policies)
                {
                    cursor += 1;
                    continue;
                }
            }
            EditOrder::Before => {
                if !attrs.insert_type.preserves_block()
                    && cursor > 0
                    && line_matches(line, &file.lines[cursor - 1], &attrs.match_policies)
                {
                    continue;
                }
            }
        }
        file.lines.insert(cursor.min(file.lines.len()), line.clone());
        cursor += 1;
        changed = true;
    }

    Ok(if changed { Outcome::Change } else { Outcome::Noop })
}

fn region_contains_line(
    lines: &[String],
    region: Region,
    line: &str,
    policies: &[InsertMatchPolicy],
) -> bool {
    let (start, end) = region.bounds(lines.len());
    lines[start..end]
        .iter()
        .any(|present| line_matches(line, present, policies))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file_of(content: &str) -> EditFile {
        EditFile::from_content(PathBuf::from("/test"), content.to_string())
    }

    fn insert(file: &mut EditFile, attrs: &InsertAttrs, promiser: &str) -> Outcome {
        let ctx = EvalContext::new();
        verify_line_insertions(file, &ctx, attrs, promiser).unwrap()
    }

    #[test]
    fn present_line_is_a_noop() {
        let mut file = file_of("a\nb\n");
        let outcome = insert(&mut file, &InsertAttrs::default(), "b");
        assert_eq!(outcome, Outcome::Noop);
        assert_eq!(file.lines, vec!["a", "b"]);
    }

    #[test]
    fn missing_line_is_appended() {
        let mut file = file_of("a\nc\n");
        let outcome = insert(&mut file, &InsertAttrs::default(), "b");
        assert_eq!(outcome, Outcome::Change);
        assert_eq!(file.lines, vec!["a", "c", "b"]);

        // Second application converges.
        let outcome = insert(&mut file, &InsertAttrs::default(), "b");
        assert_eq!(outcome, Outcome::Noop);
        assert_eq!(file.lines, vec!["a", "c", "b"]);
    }

    #[test]
    fn empty_file_is_prepended() {
        let mut file = file_of("");
        let outcome = insert(&mut file, &InsertAttrs::default(), "first");
        assert_eq!(outcome, Outcome::Change);
        assert_eq!(file.lines, vec!["first"]);
    }

    #[test]
    fn before_order_without_anchor_hits_region_start() {
        let mut file = file_of("x\ny\n");
        let attrs = InsertAttrs {
            location: LocationAttrs {
                before_after: EditOrder::Before,
                ..Default::default()
            },
            ..Default::default()
        };
        insert(&mut file, &attrs, "top");
        assert_eq!(file.lines, vec!["top", "x", "y"]);
    }

    #[test]
    fn anchored_insert_after_first_match() {
        let mut file = file_of("one\nanchor\ntwo\nanchor\n");
        let attrs = InsertAttrs {
            location: LocationAttrs {
                before_after: EditOrder::After,
                first_last: FirstLast::First,
                line_matching: Some("anchor".into()),
            },
            ..Default::default()
        };
        insert(&mut file, &attrs, "inserted");
        assert_eq!(file.lines, vec!["one", "anchor", "inserted", "two", "anchor"]);
    }

    #[test]
    fn anchored_insert_defaults_to_last_match() {
        let mut file = file_of("anchor\nmid\nanchor\n");
        let attrs = InsertAttrs {
            location: LocationAttrs {
                before_after: EditOrder::After,
                first_last: FirstLast::Last,
                line_matching: Some("anchor".into()),
            },
            ..Default::default()
        };
        insert(&mut file, &attrs, "tail");
        assert_eq!(file.lines, vec!["anchor", "mid", "anchor", "tail"]);
    }

    #[test]
    fn missing_anchor_interrupts() {
        let mut file = file_of("a\n");
        let attrs = InsertAttrs {
            location: LocationAttrs {
                line_matching: Some("nowhere".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(insert(&mut file, &attrs, "x"), Outcome::Interrupted);
    }

    #[test]
    fn multiline_block_inserts_and_converges() {
        let mut file = file_of("head\n");
        let attrs = InsertAttrs {
            insert_type: InsertType::PreserveBlock,
            ..Default::default()
        };
        assert_eq!(insert(&mut file, &attrs, "one\ntwo"), Outcome::Change);
        assert_eq!(file.lines, vec!["head", "one", "two"]);

        assert_eq!(insert(&mut file, &attrs, "one\ntwo"), Outcome::Noop);
        assert_eq!(file.lines, vec!["head", "one", "two"]);
    }

    #[test]
    fn preserve_all_lines_allows_duplicates() {
        let mut file = file_of("a\n");
        let attrs = InsertAttrs {
            insert_type: InsertType::PreserveAllLines,
            ..Default::default()
        };
        assert_eq!(insert(&mut file, &attrs, "a"), Outcome::Change);
        assert_eq!(file.lines, vec!["a", "a"]);
    }

    #[test]
    fn whitespace_policy_recognises_variants() {
        let mut file = file_of("  key=1\n");
        let attrs = InsertAttrs {
            match_policies: vec![InsertMatchPolicy::IgnoreLeading],
            ..Default::default()
        };
        assert_eq!(insert(&mut file, &attrs, "key=1"), Outcome::Noop);
    }

    #[test]
    fn insertion_restricted_to_region() {
        let mut file = file_of("pre\nBEGIN\nEND\npost\nitem\n");
        let attrs = InsertAttrs {
            region: RegionAttrs {
                select_start: Some("BEGIN".into()),
                select_end: Some("END".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        // "item" exists outside the region, so it is still inserted inside.
        assert_eq!(insert(&mut file, &attrs, "item"), Outcome::Change);
        assert_eq!(file.lines, vec!["pre", "BEGIN", "item", "END", "post", "item"]);

        assert_eq!(insert(&mut file, &attrs, "item"), Outcome::Noop);
    }

    #[test]
    fn unmatched_region_interrupts() {
        let mut file = file_of("a\n");
        let attrs = InsertAttrs {
            region: RegionAttrs {
                select_start: Some("BEGIN".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(insert(&mut file, &attrs, "x"), Outcome::Interrupted);
    }

    #[test]
    fn contradictory_policies_fail() {
        let mut file = file_of("a\n");
        let attrs = InsertAttrs {
            match_policies: vec![
                InsertMatchPolicy::ExactMatch,
                InsertMatchPolicy::IgnoreLeading,
            ],
            ..Default::default()
        };
        assert_eq!(insert(&mut file, &attrs, "x"), Outcome::Fail);
    }

    #[test]
    fn line_select_filters_chunk_lines() {
        let mut file = file_of("start\n");
        let attrs = InsertAttrs {
            line_select: LineSelect {
                startwith: Some(vec!["#".into()]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(insert(&mut file, &attrs, "# keep\ndrop"), Outcome::Change);
        assert_eq!(file.lines, vec!["start", "# keep"]);
    }

    #[test]
    fn file_sourced_insertion() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("fragment");
        std::fs::write(&source, "alpha\nbeta\n").unwrap();

        let mut file = file_of("head\n");
        let attrs = InsertAttrs {
            insert_type: InsertType::File,
            ..Default::default()
        };
        let outcome = insert(&mut file, &attrs, source.to_str().unwrap());
        assert_eq!(outcome, Outcome::Change);
        assert_eq!(file.lines, vec!["head", "alpha", "beta"]);

        assert_eq!(insert(&mut file, &attrs, source.to_str().unwrap()), Outcome::Noop);
    }

    #[test]
    fn anchored_after_insert_region_end_is_respected() {
        // After-order without anchor in a region inserts before END marker.
        let mut file = file_of("BEGIN\na\nEND\n");
        let attrs = InsertAttrs {
            region: RegionAttrs {
                select_start: Some("BEGIN".into()),
                select_end: Some("END".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        insert(&mut file, &attrs, "b");
        assert_eq!(file.lines, vec!["BEGIN", "a", "b", "END"]);
    }
}
