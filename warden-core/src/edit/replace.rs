//! Pattern replacement with convergence detection: a replacement whose
//! result still matches the search pattern is flagged, not retried.

use regex::Regex;
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

use super::file::EditFile;
use super::region::{Region, RegionAttrs, select_region};
use super::{EditError, EditResult};
use crate::eval::vars::Bindings;
use crate::eval::EvalContext;
use crate::outcome::Outcome;

/// Hard cap on substitutions in one line, against pathological patterns.
const MAX_REPLACEMENTS_PER_LINE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Occurrences {
    #[default]
    All,
    First,
}

#[derive(Debug, Clone, Default)]
pub struct ReplaceAttrs {
    pub region: RegionAttrs,
    pub replace_value: Option<String>,
    pub occurrences: Occurrences,
}

/// A pattern anchored at both ends cannot re-match its own replacement
/// span, so the convergence test is skipped for it.
fn not_anchored(pattern: &str) -> bool {
    !(pattern.starts_with('^') && pattern.ends_with('$'))
}

/// Actuate one `replace_patterns` promise against the in-memory file.
pub fn verify_patterns(
    file: &mut EditFile,
    ctx: &mut EvalContext,
    attrs: &ReplaceAttrs,
    promiser: &str,
) -> EditResult<Outcome> {
    let Some(replace_value) = &attrs.replace_value else {
        warn!(promiser, "pattern replacement has no replacement value");
        return Ok(Outcome::Fail);
    };

    let pattern = Regex::new(promiser).map_err(|e| EditError::BadRegex {
        pattern: promiser.to_string(),
        reason: e.to_string(),
    })?;

    let region = if attrs.region.is_restricted() {
        match select_region(&file.lines, &attrs.region)? {
            Ok(region) => region,
            Err(failure) => {
                warn!(promiser, "could not select an edit region ({failure:?})");
                return Ok(Outcome::Interrupted);
            }
        }
    } else {
        Region::default()
    };

    if attrs.occurrences == Occurrences::First {
        warn!(promiser, "replace-occurrences policy 'first' is not convergent");
    }

    let (start, end) = region.bounds(file.len());
    let bindings = Bindings::new();
    let mut outcome = Outcome::Noop;
    let mut any_match = false;

    for index in start..end {
        let mut line = file.lines[index].clone();
        let mut replaced = false;
        let mut last_span = 0usize;
        let mut count = 0usize;

        while let Some(captures) = pattern.captures(&line) {
            let matched = captures.get(0).unwrap();
            if last_span == line.len() {
                debug!(promiser, "match spans the whole line, de-facto convergence");
                break;
            }
            if count >= MAX_REPLACEMENTS_PER_LINE {
                debug!(promiser, "too many replacements on one line");
                break;
            }

            ctx.set_match_captures(
                captures
                    .iter()
                    .map(|g| g.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect(),
            );
            let replacement = ctx.expand_scalar(replace_value, &bindings);
            last_span = matched.end() - matched.start();

            let (span_start, span_end) = (matched.start(), matched.end());
            line.replace_range(span_start..span_end, &replacement);
            replaced = true;
            any_match = true;
            count += 1;

            if attrs.occurrences == Occurrences::First {
                break;
            }
        }

        if replaced {
            file.lines[index] = line;
            outcome = outcome.and(Outcome::Change);

            if pattern.is_match(&file.lines[index]) {
                let reason = if not_anchored(promiser) {
                    "regular expression matches the replacement string"
                } else {
                    "pattern still matches the end-state replacement"
                };
                warn!(
                    promiser,
                    line = %file.lines[index],
                    "replacement is not convergent ({reason})"
                );
                outcome = outcome.and(Outcome::Interrupted);
                break;
            }

            if attrs.occurrences == Occurrences::First {
                break;
            }
        }
    }

    ctx.clear_match_captures();

    if !any_match {
        debug!(promiser, "no match for pattern");
    }
    Ok(outcome)
}
