//! Region selection: a contiguous sub-sequence of the file's lines marked
//! out by delimiter patterns, within which the other edit operations work.

use super::{EditResult, full_match};
use crate::eval::resolve::ResolvedBody;

#[derive(Debug, Clone, Default)]
pub struct RegionAttrs {
    pub select_start: Option<String>,
    pub select_end: Option<String>,
    pub include_start: bool,
    pub include_end: bool,
    pub select_end_match_eof: bool,
}

impl RegionAttrs {
    pub fn from_body(body: &ResolvedBody) -> Self {
        Self {
            select_start: body.scalar("select_start").map(str::to_string),
            select_end: body.scalar("select_end").map(str::to_string),
            include_start: body.boolean("include_start").unwrap_or(false),
            include_end: body.boolean("include_end").unwrap_or(false),
            select_end_match_eof: body.boolean("select_end_match_eof").unwrap_or(false),
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.select_start.is_some() || self.select_end.is_some()
    }
}

/// Indices of the matched delimiter lines. `None` at either end means the
/// region extends to the corresponding end of the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    pub begin: Option<usize>,
    pub end: Option<usize>,
}

impl Region {
    /// Scan bounds for operations that include the start delimiter and stop
    /// before the end delimiter: `[begin, end)`.
    pub fn bounds(&self, len: usize) -> (usize, usize) {
        (self.begin.unwrap_or(0), self.end.unwrap_or(len))
    }

    /// Bounds for deletion, where the delimiters themselves are deletable
    /// when marked included.
    pub fn deletable_bounds(&self, attrs: &RegionAttrs, len: usize) -> (usize, usize) {
        let start = match self.begin {
            None => 0,
            Some(b) if attrs.include_start => b,
            Some(b) => (b + 1).min(len),
        };
        let end = match self.end {
            None => len,
            Some(e) if attrs.include_end => (e + 1).min(len),
            Some(e) => e,
        };
        (start, end.max(start))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionFailure {
    /// The start pattern never matched.
    StartNotFound,
    /// The start matched the last line with the delimiter excluded, leaving
    /// nothing to edit.
    EmptyAtEof,
    /// The end pattern never matched and matching EOF was not allowed.
    EndNotFound,
}

/// Locate the region delimited by the attribute patterns. Without
/// delimiters the whole file is the region.
pub fn select_region(
    lines: &[String],
    attrs: &RegionAttrs,
) -> EditResult<Result<Region, RegionFailure>> {
    let mut begin = None;
    let mut end = None;

    for (index, line) in lines.iter().enumerate() {
        if let Some(start_pattern) = &attrs.select_start {
            if begin.is_none() {
                if full_match(start_pattern, line)? {
                    if !attrs.include_start && index + 1 == lines.len() {
                        return Ok(Err(RegionFailure::EmptyAtEof));
                    }
                    begin = Some(index);
                }
                continue;
            }
        }
        if let Some(end_pattern) = &attrs.select_end {
            if begin.is_some() || attrs.select_start.is_none() {
                if full_match(end_pattern, line)? {
                    end = Some(index);
                    break;
                }
            }
        }
    }

    if attrs.select_start.is_some() && begin.is_none() {
        return Ok(Err(RegionFailure::StartNotFound));
    }
    if attrs.select_end.is_some() && end.is_none() && !attrs.select_end_match_eof {
        return Ok(Err(RegionFailure::EndNotFound));
    }

    Ok(Ok(Region { begin, end }))
}
