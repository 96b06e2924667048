//! Column editing: lines matching a pattern are split into fields by a
//! separator regex, one field is edited (optionally as a sub-list), and the
//! line is reassembled.

use regex::Regex;
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

use super::file::EditFile;
use super::region::{Region, RegionAttrs, select_region};
use super::{EditError, EditResult, full_match};
use crate::outcome::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FieldOperation {
    Set,
    Delete,
    Prepend,
    /// Idempotent insert keeping the sub-list sorted.
    Alphanum,
    #[default]
    Append,
}

#[derive(Debug, Clone, Default)]
pub struct FieldAttrs {
    pub region: RegionAttrs,
    pub field_separator: Option<String>,
    /// 1-based index of the field to edit.
    pub select_field: Option<i64>,
    /// Single character splitting the field into a sub-list.
    pub value_separator: Option<char>,
    pub field_operation: FieldOperation,
    pub field_value: Option<String>,
    pub extend_columns: bool,
    pub allow_blank_fields: bool,
}

/// Actuate one `field_edits` promise against the in-memory file.
pub fn verify_column_edits(
    file: &mut EditFile,
    attrs: &FieldAttrs,
    promiser: &str,
) -> EditResult<Outcome> {
    let Some(separator) = &attrs.field_separator else {
        warn!(promiser, "no field_separator in promise to edit by column");
        return Ok(Outcome::Fail);
    };
    let select_field = match attrs.select_field {
        Some(n) if n > 0 => n as usize,
        _ => {
            warn!(promiser, "no usable select_field in promise to edit by column");
            return Ok(Outcome::Fail);
        }
    };
    let Some(field_value) = &attrs.field_value else {
        warn!(promiser, "no field_value is promised to the column edit");
        return Ok(Outcome::Fail);
    };

    let separator_re = Regex::new(separator).map_err(|e| EditError::BadRegex {
        pattern: separator.clone(),
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
    let (start, end) = region.bounds(file.len());

    let mut outcome = Outcome::Noop;
    let mut found_match = false;

    for index in start..end {
        if !full_match(promiser, &file.lines[index])? {
            continue;
        }
        found_match = true;
        debug!(line = %file.lines[index], "matched line for field edit");

        let line = file.lines[index].clone();
        let Some(first_separator) = separator_re.find(&line) else {
            warn!(promiser, "no fields found by the promised separator");
            return Ok(outcome.and(Outcome::Interrupted));
        };
        let join_text = first_separator.as_str().to_string();

        let mut fields: Vec<String> = separator_re.split(&line).map(str::to_string).collect();
        if !attrs.allow_blank_fields {
            // Matching the original splitter: blank fields are kept; the
            // flag only controls whether fully blank EDGE fields survive.
            while fields.last().is_some_and(|f| f.is_empty()) && fields.len() > select_field {
                fields.pop();
            }
        }

        if fields.len() < select_field {
            if !attrs.extend_columns {
                warn!(
                    promiser,
                    have = fields.len(),
                    wanted = select_field,
                    "line has fewer fields than the promise selects"
                );
                return Ok(outcome.and(Outcome::Interrupted));
            }
            fields.resize(select_field, String::new());
        }

        let slot = &mut fields[select_field - 1];
        let changed = match attrs.value_separator {
            Some(value_separator) => {
                edit_sub_list(slot, value_separator, attrs.field_operation, field_value)
            }
            None => edit_whole_field(slot, attrs.field_operation, field_value),
        };

        if changed {
            file.lines[index] = fields.join(&join_text);
            outcome = outcome.and(Outcome::Change);
        }
    }

    if !found_match {
        warn!(promiser, "no matched line to edit fields of");
        return Ok(outcome.and(Outcome::Fail));
    }
    Ok(outcome)
}

fn edit_whole_field(field: &mut String, operation: FieldOperation, value: &str) -> bool {
    match operation {
        FieldOperation::Delete => {
            if field.is_empty() {
                false
            } else {
                field.clear();
                true
            }
        }
        // Everything except delete sets the whole field when no
        // value separator is in play.
        _ => {
            if field == value {
                false
            } else {
                *field = value.to_string();
                true
            }
        }
    }
}

fn edit_sub_list(
    field: &mut String,
    separator: char,
    operation: FieldOperation,
    value: &str,
) -> bool {
    let mut items: Vec<String> = if field.is_empty() {
        Vec::new()
    } else {
        field.split(separator).map(str::to_string).collect()
    };

    let changed = match operation {
        FieldOperation::Delete => {
            let before = items.len();
            items.retain(|item| item != value);
            items.len() != before
        }
        FieldOperation::Set => {
            if items.len() == 1 && items[0] == value {
                false
            } else if items.is_empty() && value.is_empty() {
                false
            } else {
                items = vec![value.to_string()];
                true
            }
        }
        FieldOperation::Prepend => {
            if items.iter().any(|item| item == value) {
                false
            } else {
                items.insert(0, value.to_string());
                true
            }
        }
        FieldOperation::Alphanum => {
            if items.iter().any(|item| item == value) {
                false
            } else {
                items.push(value.to_string());
                items.sort();
                true
            }
        }
        FieldOperation::Append => {
            if items.iter().any(|item| item == value) {
                false
            } else {
                items.push(value.to_string());
                true
            }
        }
    };

    if changed {
        *field = items.join(&separator.to_string());
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file_of(content: &str) -> EditFile {
        EditFile::from_content(PathBuf::from("/test"), content.to_string())
    }

    fn passwd_attrs() -> FieldAttrs {
        FieldAttrs {
            field_separator: Some(":".into()),
            select_field: Some(7),
            field_operation: FieldOperation::Set,
            field_value: Some("/bin/bash".into()),
            ..Default::default()
        }
    }

    #[test]
    fn sets_a_field_in_place() {
        let mut file = file_of("root:x:0:0:root:/root:/bin/sh\ndaemon:x:1:1::/:/bin/sh\n");
        let outcome = verify_column_edits(&mut file, &passwd_attrs(), "^root:.*").unwrap();
        assert_eq!(outcome, Outcome::Change);
        assert_eq!(file.lines[0], "root:x:0:0:root:/root:/bin/bash");
        assert_eq!(file.lines[1], "daemon:x:1:1::/:/bin/sh");

        // Converged on the second run.
        let outcome = verify_column_edits(&mut file, &passwd_attrs(), "^root:.*").unwrap();
        assert_eq!(outcome, Outcome::Noop);
    }

    #[test]
    fn short_rows_extend_when_allowed() {
        let mut file = file_of("a:b\n");
        let mut attrs = passwd_attrs();
        attrs.select_field = Some(4);
        attrs.field_value = Some("z".into());

        let outcome = verify_column_edits(&mut file, &attrs, "^a:.*").unwrap();
        assert_eq!(outcome, Outcome::Interrupted);

        attrs.extend_columns = true;
        let outcome = verify_column_edits(&mut file, &attrs, "^a:.*").unwrap();
        assert_eq!(outcome, Outcome::Change);
        assert_eq!(file.lines[0], "a:b::z");
    }

    #[test]
    fn append_to_sub_list_is_idempotent() {
        let mut file = file_of("wheel:x:10:root\n");
        let attrs = FieldAttrs {
            field_separator: Some(":".into()),
            select_field: Some(4),
            value_separator: Some(','),
            field_operation: FieldOperation::Append,
            field_value: Some("alice".into()),
            ..Default::default()
        };

        let outcome = verify_column_edits(&mut file, &attrs, "^wheel:.*").unwrap();
        assert_eq!(outcome, Outcome::Change);
        assert_eq!(file.lines[0], "wheel:x:10:root,alice");

        let outcome = verify_column_edits(&mut file, &attrs, "^wheel:.*").unwrap();
        assert_eq!(outcome, Outcome::Noop);
    }

    #[test]
    fn delete_from_sub_list() {
        let mut file = file_of("wheel:x:10:root,alice,bob\n");
        let attrs = FieldAttrs {
            field_separator: Some(":".into()),
            select_field: Some(4),
            value_separator: Some(','),
            field_operation: FieldOperation::Delete,
            field_value: Some("alice".into()),
            ..Default::default()
        };
        let outcome = verify_column_edits(&mut file, &attrs, "^wheel:.*").unwrap();
        assert_eq!(outcome, Outcome::Change);
        assert_eq!(file.lines[0], "wheel:x:10:root,bob");
    }

    #[test]
    fn alphanum_keeps_sub_list_sorted() {
        let mut file = file_of("g:x:1:bob,dave\n");
        let attrs = FieldAttrs {
            field_separator: Some(":".into()),
            select_field: Some(4),
            value_separator: Some(','),
            field_operation: FieldOperation::Alphanum,
            field_value: Some("carol".into()),
            ..Default::default()
        };
        verify_column_edits(&mut file, &attrs, "^g:.*").unwrap();
        assert_eq!(file.lines[0], "g:x:1:bob,carol,dave");
    }

    #[test]
    fn prepend_goes_first() {
        let mut file = file_of("g:x:1:bob\n");
        let attrs = FieldAttrs {
            field_separator: Some(":".into()),
            select_field: Some(4),
            value_separator: Some(','),
            field_operation: FieldOperation::Prepend,
            field_value: Some("admin".into()),
            ..Default::default()
        };
        verify_column_edits(&mut file, &attrs, "^g:.*").unwrap();
        assert_eq!(file.lines[0], "g:x:1:admin,bob");
    }

    #[test]
    fn no_matching_line_fails() {
        let mut file = file_of("other\n");
        let outcome = verify_column_edits(&mut file, &passwd_attrs(), "^root:.*").unwrap();
        assert_eq!(outcome, Outcome::Fail);
    }

    #[test]
    fn missing_required_attributes_fail() {
        let mut file = file_of("a:b\n");
        let attrs = FieldAttrs {
            select_field: Some(1),
            field_value: Some("x".into()),
            ..Default::default()
        };
        assert_eq!(
            verify_column_edits(&mut file, &attrs, ".*").unwrap(),
            Outcome::Fail
        );
    }
}
