//! Line matching helpers: the whitespace policies applied when testing
//! whether a promised line is already present, and the line-selection
//! filters that restrict which lines an operation may touch.

use regex::Regex;
use strum_macros::{Display, EnumString};

use super::{EditError, EditResult, full_match};
use crate::eval::resolve::ResolvedBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum InsertMatchPolicy {
    #[strum(serialize = "exact_match")]
    ExactMatch,
    #[strum(serialize = "ignore_leading")]
    IgnoreLeading,
    #[strum(serialize = "ignore_trailing")]
    IgnoreTrailing,
    #[strum(serialize = "ignore_embedded_whitespace")]
    IgnoreEmbedded,
}

/// Parse the `insert_match` attribute list. Unknown words are rejected.
pub fn parse_match_policies(words: &[String]) -> EditResult<Vec<InsertMatchPolicy>> {
    words
        .iter()
        .map(|word| {
            word.parse::<InsertMatchPolicy>()
                .map_err(|_| EditError::BadAttribute {
                    attribute: "insert_match".into(),
                    value: word.clone(),
                })
        })
        .collect()
}

/// `exact_match` may not be combined with any of the ignore policies.
pub fn policies_consistent(policies: &[InsertMatchPolicy]) -> bool {
    let exact = policies.contains(&InsertMatchPolicy::ExactMatch);
    let ignore = policies.iter().any(|p| *p != InsertMatchPolicy::ExactMatch);
    !(exact && ignore)
}

/// Translate one promised line into the regex implied by the whitespace
/// policies and test it against a line already in the file.
pub fn line_matches(promised: &str, present: &str, policies: &[InsertMatchPolicy]) -> bool {
    if policies.is_empty() || policies.contains(&InsertMatchPolicy::ExactMatch) {
        return promised == present;
    }

    let mut pattern = regex::escape(promised);

    if policies.contains(&InsertMatchPolicy::IgnoreEmbedded) {
        let trimmed = pattern.trim().to_string();
        let mut collapsed = String::with_capacity(trimmed.len());
        let mut in_gap = false;
        for c in trimmed.chars() {
            if c == ' ' || c == '\t' {
                if !in_gap {
                    collapsed.push_str("\\s+");
                    in_gap = true;
                }
            } else {
                collapsed.push(c);
                in_gap = false;
            }
        }
        pattern = collapsed;
    }
    if policies.contains(&InsertMatchPolicy::IgnoreLeading) {
        pattern = format!("\\s*{}", pattern.trim_start());
    }
    if policies.contains(&InsertMatchPolicy::IgnoreTrailing) {
        pattern = format!("{}\\s*", pattern.trim_end());
    }

    full_match(&pattern, present).unwrap_or(false)
}

/// Which lines an insertion or deletion is allowed to consider. The
/// positive and negative families are mutually exclusive.
#[derive(Debug, Clone, Default)]
pub struct LineSelect {
    pub startwith: Option<Vec<String>>,
    pub not_startwith: Option<Vec<String>>,
    pub match_regex: Option<Vec<String>>,
    pub not_match_regex: Option<Vec<String>>,
    pub contains: Option<Vec<String>>,
    pub not_contains: Option<Vec<String>>,
}

impl LineSelect {
    pub fn from_body(body: &ResolvedBody) -> Self {
        Self {
            startwith: body.list("startwith_from_list"),
            not_startwith: body.list("not_startwith_from_list"),
            match_regex: body.list("match_from_list"),
            not_match_regex: body.list("not_match_from_list"),
            contains: body.list("contains_from_list"),
            not_contains: body.list("not_contains_from_list"),
        }
    }

    /// At most one negative family, and never a mix of positive and
    /// negative constraints.
    pub fn consistent(&self) -> bool {
        let positives = [&self.startwith, &self.match_regex, &self.contains]
            .iter()
            .filter(|f| f.is_some())
            .count();
        let negatives = [&self.not_startwith, &self.not_match_regex, &self.not_contains]
            .iter()
            .filter(|f| f.is_some())
            .count();
        negatives <= 1 && !(positives > 0 && negatives > 0)
    }

    pub fn is_restricted(&self) -> bool {
        self.startwith.is_some()
            || self.not_startwith.is_some()
            || self.match_regex.is_some()
            || self.not_match_regex.is_some()
            || self.contains.is_some()
            || self.not_contains.is_some()
    }

    /// Decide whether a line may be touched. The first family present
    /// decides, mirroring the original's precedence.
    pub fn selects(&self, line: &str) -> EditResult<bool> {
        if let Some(prefixes) = &self.startwith {
            return Ok(prefixes.iter().any(|p| line.starts_with(p.as_str())));
        }
        if let Some(prefixes) = &self.not_startwith {
            return Ok(!prefixes.iter().any(|p| line.starts_with(p.as_str())));
        }
        if let Some(patterns) = &self.match_regex {
            for pattern in patterns {
                if full_match(pattern, line)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        if let Some(patterns) = &self.not_match_regex {
            for pattern in patterns {
                if full_match(pattern, line)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        if let Some(patterns) = &self.contains {
            for pattern in patterns {
                if search(pattern, line)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        if let Some(patterns) = &self.not_contains {
            for pattern in patterns {
                if search(pattern, line)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        Ok(true)
    }
}

/// Unanchored regex search.
pub fn search(pattern: &str, text: &str) -> EditResult<bool> {
    let re = Regex::new(pattern).map_err(|e| EditError::BadRegex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;
    Ok(re.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_the_default() {
        assert!(line_matches("a = 1", "a = 1", &[]));
        assert!(!line_matches("a = 1", "a  =  1", &[]));
    }

    #[test]
    fn ignore_leading_and_trailing() {
        let leading = [InsertMatchPolicy::IgnoreLeading];
        assert!(line_matches("key=1", "   key=1", &leading));
        assert!(!line_matches("key=1", "key=1   ", &leading));

        let trailing = [InsertMatchPolicy::IgnoreTrailing];
        assert!(line_matches("key=1", "key=1   ", &trailing));
        assert!(!line_matches("key=1", "   key=1", &trailing));
    }

    #[test]
    fn ignore_embedded_collapses_runs() {
        let policies = [InsertMatchPolicy::IgnoreEmbedded];
        assert!(line_matches("a = 1", "a  =      1", &policies));
        assert!(line_matches("a = 1", "a\t=\t1", &policies));
        assert!(!line_matches("a = 1", "a=1", &policies));
    }

    #[test]
    fn promised_line_with_regex_chars_is_literal() {
        let policies = [InsertMatchPolicy::IgnoreLeading];
        assert!(line_matches("opts=(a|b)", "  opts=(a|b)", &policies));
        assert!(!line_matches("opts=(a|b)", "  opts=a", &policies));
    }

    #[test]
    fn exact_mixed_with_ignore_is_inconsistent() {
        assert!(policies_consistent(&[InsertMatchPolicy::ExactMatch]));
        assert!(policies_consistent(&[
            InsertMatchPolicy::IgnoreLeading,
            InsertMatchPolicy::IgnoreTrailing
        ]));
        assert!(!policies_consistent(&[
            InsertMatchPolicy::ExactMatch,
            InsertMatchPolicy::IgnoreLeading
        ]));
    }

    #[test]
    fn parse_rejects_unknown_policy_words() {
        assert!(parse_match_policies(&["ignore_leading".into()]).is_ok());
        assert!(parse_match_policies(&["fuzzy".into()]).is_err());
    }

    #[test]
    fn startwith_filter() {
        let select = LineSelect {
            startwith: Some(vec!["#".into(), ";".into()]),
            ..Default::default()
        };
        assert!(select.selects("# comment").unwrap());
        assert!(select.selects("; other").unwrap());
        assert!(!select.selects("value").unwrap());
    }

    #[test]
    fn negative_filters_invert() {
        let select = LineSelect {
            not_contains: Some(vec!["keep".into()]),
            ..Default::default()
        };
        assert!(!select.selects("please keep me").unwrap());
        assert!(select.selects("delete me").unwrap());
    }

    #[test]
    fn mixing_families_is_inconsistent() {
        let select = LineSelect {
            startwith: Some(vec!["#".into()]),
            not_contains: Some(vec!["x".into()]),
            ..Default::default()
        };
        assert!(!select.consistent());

        let two_negatives = LineSelect {
            not_startwith: Some(vec!["#".into()]),
            not_contains: Some(vec!["x".into()]),
            ..Default::default()
        };
        assert!(!two_negatives.consistent());
    }

    #[test]
    fn unrestricted_select_accepts_everything() {
        let select = LineSelect::default();
        assert!(select.consistent());
        assert!(!select.is_restricted());
        assert!(select.selects("anything").unwrap());
    }
}
