//! Convergent line deletion: lines or consecutive blocks matching the
//! promised pattern are excised from the selected region.

use tracing::{debug, warn};

use super::file::EditFile;
use super::region::{Region, RegionAttrs, select_region};
use super::select::LineSelect;
use super::{EditResult, full_match};
use crate::outcome::Outcome;

#[derive(Debug, Clone, Default)]
pub struct DeleteAttrs {
    pub region: RegionAttrs,
    pub not_matching: bool,
    pub line_select: LineSelect,
}

/// Does the multi-line pattern match the consecutive lines starting at
/// `base`, staying inside `end`? Returns the number of lines covered.
fn block_match_at(
    lines: &[String],
    base: usize,
    end: usize,
    patterns: &[String],
) -> EditResult<usize> {
    if base + patterns.len() > end {
        return Ok(0);
    }
    for (offset, pattern) in patterns.iter().enumerate() {
        if !full_match(pattern, &lines[base + offset])? {
            return Ok(0);
        }
    }
    Ok(patterns.len())
}

/// Actuate one `delete_lines` promise against the in-memory file.
pub fn verify_line_deletions(
    file: &mut EditFile,
    attrs: &DeleteAttrs,
    promiser: &str,
) -> EditResult<Outcome> {
    let patterns: Vec<String> = promiser.split('\n').map(str::to_string).collect();

    if patterns.len() > 1 && attrs.not_matching {
        warn!(
            promiser,
            "multi-line deletion with not_matching cannot hold for all lines as a block"
        );
    }
    if !attrs.line_select.consistent() {
        warn!(promiser, "line deletion mixes positive and negative filters");
        return Ok(Outcome::Interrupted);
    }

    let region = if attrs.region.is_restricted() {
        match select_region(&file.lines, &attrs.region)? {
            Ok(region) => region,
            Err(failure) => {
                if attrs.region.include_start || attrs.region.include_end {
                    warn!(
                        promiser,
                        file = %file.path.display(),
                        "could not select an edit region ({failure:?}); \
                         the markers themselves were up for deletion"
                    );
                } else {
                    warn!(
                        promiser,
                        file = %file.path.display(),
                        "could not select an edit region ({failure:?})"
                    );
                }
                return Ok(Outcome::Interrupted);
            }
        }
    } else {
        Region::default()
    };

    let (start, mut end) = region.deletable_bounds(&attrs.region, file.len());

    let mut index = start;
    let mut deleted = 0usize;
    while index < end {
        if !attrs.line_select.selects(&file.lines[index])? {
            index += 1;
            continue;
        }

        let span = if attrs.not_matching {
            // Delete single lines where the block does not match.
            if block_match_at(&file.lines, index, end, &patterns)? == 0 {
                1
            } else {
                0
            }
        } else {
            block_match_at(&file.lines, index, end, &patterns)?
        };

        if span > 0 {
            debug!(promiser, lines = span, at = index, "deleting matched lines");
            file.lines.drain(index..index + span);
            end -= span;
            deleted += span;
        } else {
            index += 1;
        }
    }

    Ok(if deleted > 0 {
        Outcome::Change
    } else {
        Outcome::Noop
    })
}
