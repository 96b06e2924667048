//! Static description of the promise types, attributes and body shapes the
//! engine understands. The validator consults these tables; nothing here is
//! host state.

use strum_macros::{AsRefStr, Display, EnumString};

use super::Rval;

/// Declared data type of a constraint's right-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DataKind {
    Str,
    Int,
    Real,
    /// One word out of a closed set.
    Opt,
    /// A class expression.
    Context,
    /// Symbolic reference to a body of the same type as the lval.
    Body,
    /// Symbolic reference to a bundle.
    Bundle,
    StrList,
    IntList,
    RealList,
    OptList,
    ContextList,
    /// Structured JSON data.
    Container,
}

impl DataKind {
    /// Whether an rval of the given shape can satisfy this declared type.
    /// Function calls are accepted everywhere; their returned value is
    /// re-checked after expansion.
    pub fn accepts(self, rval: &Rval) -> bool {
        if matches!(rval, Rval::FnCall(_)) {
            return true;
        }
        match self {
            DataKind::Str
            | DataKind::Int
            | DataKind::Real
            | DataKind::Opt
            | DataKind::Context
            | DataKind::Body
            | DataKind::Bundle => matches!(rval, Rval::Scalar(_)),
            DataKind::StrList
            | DataKind::IntList
            | DataKind::RealList
            | DataKind::OptList
            | DataKind::ContextList => matches!(rval, Rval::Scalar(_) | Rval::List(_)),
            DataKind::Container => matches!(rval, Rval::Container(_)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConstraintSyntax {
    pub lval: &'static str,
    pub dtype: DataKind,
}

const fn attr(lval: &'static str, dtype: DataKind) -> ConstraintSyntax {
    ConstraintSyntax { lval, dtype }
}

/// Attributes legal on every promise regardless of type.
pub const COMMON_ATTRIBUTES: &[ConstraintSyntax] = &[
    attr("action", DataKind::Body),
    attr("classes", DataKind::Body),
    attr("comment", DataKind::Str),
    attr("depends_on", DataKind::StrList),
    attr("handle", DataKind::Str),
    attr("if", DataKind::Context),
    attr("ifvarclass", DataKind::Context),
    attr("meta", DataKind::StrList),
];

/// Attributes legal on every promise inside an `edit_line` bundle.
pub const COMMON_EDIT_ATTRIBUTES: &[ConstraintSyntax] = &[attr("select_region", DataKind::Body)];

const VARS_ATTRIBUTES: &[ConstraintSyntax] = &[
    attr("string", DataKind::Str),
    attr("slist", DataKind::StrList),
    attr("int", DataKind::Int),
    attr("real", DataKind::Real),
    attr("data", DataKind::Container),
];

const CLASSES_ATTRIBUTES: &[ConstraintSyntax] = &[
    attr("expression", DataKind::Context),
    attr("not", DataKind::Context),
    attr("and", DataKind::ContextList),
    attr("or", DataKind::ContextList),
    attr("xor", DataKind::ContextList),
    attr("scope", DataKind::Opt),
    attr("persistence", DataKind::Int),
];

const REPORTS_ATTRIBUTES: &[ConstraintSyntax] = &[attr("report_to_file", DataKind::Str)];

const FILES_ATTRIBUTES: &[ConstraintSyntax] = &[
    attr("create", DataKind::Opt),
    attr("edit_line", DataKind::Bundle),
    attr("edit_template", DataKind::Str),
    attr("edit_defaults", DataKind::Body),
    attr("changes", DataKind::Body),
];

const PACKAGES_ATTRIBUTES: &[ConstraintSyntax] = &[
    attr("policy", DataKind::Opt),
    attr("package_module", DataKind::Body),
    attr("version", DataKind::Str),
    attr("architecture", DataKind::Str),
    attr("options", DataKind::StrList),
];

const INSERT_LINES_ATTRIBUTES: &[ConstraintSyntax] = &[
    attr("insert_type", DataKind::Opt),
    attr("insert_match", DataKind::OptList),
    attr("expand_scalars", DataKind::Opt),
    attr("location", DataKind::Body),
    attr("insert_select", DataKind::Body),
];

const DELETE_LINES_ATTRIBUTES: &[ConstraintSyntax] = &[
    attr("not_matching", DataKind::Opt),
    attr("delete_select", DataKind::Body),
];

const REPLACE_PATTERNS_ATTRIBUTES: &[ConstraintSyntax] = &[attr("replace_with", DataKind::Body)];

const FIELD_EDITS_ATTRIBUTES: &[ConstraintSyntax] = &[attr("edit_field", DataKind::Body)];

#[derive(Debug, Clone, Copy)]
pub struct PromiseTypeSyntax {
    /// Bundle type this section is valid in; `"*"` matches any.
    pub bundle_type: &'static str,
    pub promise_type: &'static str,
    pub constraints: &'static [ConstraintSyntax],
}

const fn section(
    bundle_type: &'static str,
    promise_type: &'static str,
    constraints: &'static [ConstraintSyntax],
) -> PromiseTypeSyntax {
    PromiseTypeSyntax {
        bundle_type,
        promise_type,
        constraints,
    }
}

pub const PROMISE_TYPES: &[PromiseTypeSyntax] = &[
    section("*", "vars", VARS_ATTRIBUTES),
    section("*", "classes", CLASSES_ATTRIBUTES),
    section("*", "reports", REPORTS_ATTRIBUTES),
    section("agent", "files", FILES_ATTRIBUTES),
    section("agent", "packages", PACKAGES_ATTRIBUTES),
    section("edit_line", "insert_lines", INSERT_LINES_ATTRIBUTES),
    section("edit_line", "delete_lines", DELETE_LINES_ATTRIBUTES),
    section("edit_line", "replace_patterns", REPLACE_PATTERNS_ATTRIBUTES),
    section("edit_line", "field_edits", FIELD_EDITS_ATTRIBUTES),
];

#[derive(Debug, Clone, Copy)]
pub struct BodySyntax {
    pub body_type: &'static str,
    pub constraints: &'static [ConstraintSyntax],
}

const fn body(body_type: &'static str, constraints: &'static [ConstraintSyntax]) -> BodySyntax {
    BodySyntax {
        body_type,
        constraints,
    }
}

pub const BODY_TYPES: &[BodySyntax] = &[
    // `body common control` — the run's control body.
    body(
        "common",
        &[
            attr("bundlesequence", DataKind::StrList),
            attr("require_comments", DataKind::Opt),
            attr("ignore_missing_bundles", DataKind::Opt),
            attr("version", DataKind::Str),
        ],
    ),
    body(
        "action",
        &[
            attr("action_policy", DataKind::Opt),
            attr("ifelapsed", DataKind::Int),
            attr("expireafter", DataKind::Int),
        ],
    ),
    body(
        "classes",
        &[
            attr("promise_kept", DataKind::StrList),
            attr("promise_repaired", DataKind::StrList),
            attr("repair_failed", DataKind::StrList),
            attr("scope", DataKind::Opt),
        ],
    ),
    body(
        "select_region",
        &[
            attr("select_start", DataKind::Str),
            attr("select_end", DataKind::Str),
            attr("include_start", DataKind::Opt),
            attr("include_end", DataKind::Opt),
            attr("select_end_match_eof", DataKind::Opt),
        ],
    ),
    body(
        "location",
        &[
            attr("before_after", DataKind::Opt),
            attr("first_last", DataKind::Opt),
            attr("select_line_matching", DataKind::Str),
        ],
    ),
    body(
        "insert_select",
        &[
            attr("startwith_from_list", DataKind::StrList),
            attr("not_startwith_from_list", DataKind::StrList),
            attr("match_from_list", DataKind::StrList),
            attr("not_match_from_list", DataKind::StrList),
            attr("contains_from_list", DataKind::StrList),
            attr("not_contains_from_list", DataKind::StrList),
        ],
    ),
    body(
        "delete_select",
        &[
            attr("startwith_from_list", DataKind::StrList),
            attr("not_startwith_from_list", DataKind::StrList),
            attr("match_from_list", DataKind::StrList),
            attr("not_match_from_list", DataKind::StrList),
            attr("contains_from_list", DataKind::StrList),
            attr("not_contains_from_list", DataKind::StrList),
        ],
    ),
    body(
        "replace_with",
        &[
            attr("replace_value", DataKind::Str),
            attr("occurrences", DataKind::Opt),
        ],
    ),
    body(
        "edit_field",
        &[
            attr("field_separator", DataKind::Str),
            attr("select_field", DataKind::Int),
            attr("value_separator", DataKind::Str),
            attr("field_operation", DataKind::Opt),
            attr("field_value", DataKind::Str),
            attr("extend_columns", DataKind::Opt),
            attr("allow_blank_fields", DataKind::Opt),
        ],
    ),
    body(
        "edit_defaults",
        &[
            attr("edit_backup", DataKind::Opt),
            attr("max_file_size", DataKind::Int),
            attr("empty_file_before_editing", DataKind::Opt),
        ],
    ),
    body(
        "changes",
        &[
            attr("hash", DataKind::Opt),
            attr("report_changes", DataKind::Opt),
            attr("update_hashes", DataKind::Opt),
        ],
    ),
    body(
        "package_module",
        &[
            attr("module_path", DataKind::Str),
            attr("interpreter", DataKind::Str),
            attr("query_installed_ifelapsed", DataKind::Int),
            attr("query_updates_ifelapsed", DataKind::Int),
            attr("default_options", DataKind::StrList),
        ],
    ),
    // Multiple definitions of a "file" body are tolerated as textual includes.
    body("file", &[attr("source", DataKind::Str)]),
];

/// Bundle types the engine knows how to schedule or reference.
pub const BUILTIN_BUNDLE_TYPES: &[&str] = &[
    "agent",
    "common",
    "edit_line",
    "edit_xml",
    "server",
    "monitor",
    "knowledge",
];

pub fn is_builtin_bundle_type(bundle_type: &str) -> bool {
    BUILTIN_BUNDLE_TYPES.contains(&bundle_type)
}

pub fn is_builtin_promise_type(promise_type: &str) -> bool {
    PROMISE_TYPES.iter().any(|s| s.promise_type == promise_type)
}

/// Table lookup for a bundle-type / section-type pair.
pub fn promise_type_syntax(bundle_type: &str, promise_type: &str) -> Option<&'static PromiseTypeSyntax> {
    PROMISE_TYPES.iter().find(|s| {
        s.promise_type == promise_type && (s.bundle_type == "*" || s.bundle_type == bundle_type)
    })
}

pub fn body_syntax(body_type: &str) -> Option<&'static BodySyntax> {
    BODY_TYPES.iter().find(|b| b.body_type == body_type)
}

/// Resolve the declared syntax of a constraint lval within a section, falling
/// back to the common tables the way the original resolves through
/// CF_COMMON_BODIES and CF_COMMON_EDITBODIES.
pub fn constraint_syntax(
    bundle_type: &str,
    promise_type: &str,
    lval: &str,
) -> Option<ConstraintSyntax> {
    if let Some(pts) = promise_type_syntax(bundle_type, promise_type) {
        if let Some(found) = pts.constraints.iter().find(|c| c.lval == lval) {
            return Some(*found);
        }
    }
    if let Some(found) = COMMON_ATTRIBUTES.iter().find(|c| c.lval == lval) {
        return Some(*found);
    }
    if bundle_type == "edit_line" {
        if let Some(found) = COMMON_EDIT_ATTRIBUTES.iter().find(|c| c.lval == lval) {
            return Some(*found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_types_reject_lists() {
        assert!(DataKind::Str.accepts(&Rval::scalar("x")));
        assert!(!DataKind::Str.accepts(&Rval::List(vec![])));
        assert!(DataKind::StrList.accepts(&Rval::scalar("x")));
        assert!(DataKind::StrList.accepts(&Rval::List(vec![])));
    }

    #[test]
    fn fncall_accepted_everywhere() {
        let call = Rval::FnCall(crate::policy::FnCall {
            name: "readfile".into(),
            args: vec![],
        });
        assert!(DataKind::Int.accepts(&call));
        assert!(DataKind::Container.accepts(&call));
    }

    #[test]
    fn lookup_honours_bundle_type() {
        assert!(promise_type_syntax("edit_line", "insert_lines").is_some());
        assert!(promise_type_syntax("agent", "insert_lines").is_none());
        assert!(promise_type_syntax("agent", "vars").is_some());
        assert!(promise_type_syntax("common", "vars").is_some());
    }

    #[test]
    fn common_attributes_resolve_for_any_section() {
        let found = constraint_syntax("agent", "files", "handle").unwrap();
        assert_eq!(found.dtype, DataKind::Str);
        // select_region is only common within edit_line bundles
        assert!(constraint_syntax("edit_line", "insert_lines", "select_region").is_some());
        assert!(constraint_syntax("agent", "files", "select_region").is_none());
    }
}
