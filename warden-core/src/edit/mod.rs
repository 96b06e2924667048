//! The edit-line engine: a convergent in-memory editor for text files.
//! Promises from an `edit_line` bundle are applied to the file's line
//! sequence in a fixed section order, looped until a pass makes no further
//! changes; the result is saved through an atomic replace.

pub mod delete;
pub mod fields;
pub mod file;
pub mod insert;
pub mod region;
pub mod replace;
pub mod select;
pub mod template;

use std::collections::{HashMap, HashSet};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::eval::classes::{evaluate_classes_promise, PersistentClassStore};
use crate::eval::expand::expand_promise;
use crate::eval::resolve::{body_attributes, ResolvedBody};
use crate::eval::vars::evaluate_vars_promise;
use crate::eval::{EvalContext, Value};
use crate::locks::{LockDenied, LockManager};
use crate::outcome::Outcome;
use crate::policy::{Bundle, BundleId, Policy, Promise, Rval};

use self::delete::DeleteAttrs;
use self::fields::{FieldAttrs, FieldOperation};
use self::file::EditFile;
use self::insert::{EditOrder, FirstLast, InsertAttrs, InsertType, LocationAttrs};
use self::region::RegionAttrs;
use self::replace::{Occurrences, ReplaceAttrs};
use self::select::{parse_match_policies, LineSelect};

#[derive(Error, Debug)]
pub enum EditError {
    #[error("i/o on '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid regular expression '{pattern}': {reason}")]
    BadRegex { pattern: String, reason: String },

    #[error("invalid value '{value}' for attribute '{attribute}'")]
    BadAttribute { attribute: String, value: String },

    #[error("template '{path}' syntax error at line {line}: {reason}")]
    TemplateSyntax {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("lock error: {0}")]
    Lock(#[from] crate::locks::LockError),
}

pub type EditResult<T> = std::result::Result<T, EditError>;

/// Anchored full-line regex test.
pub(crate) fn full_match(pattern: &str, text: &str) -> EditResult<bool> {
    let re = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| EditError::BadRegex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;
    Ok(re.is_match(text))
}

/// Section evaluation order within one `edit_line` bundle.
pub const EDIT_SECTION_ORDER: &[&str] = &[
    "vars",
    "classes",
    "delete_lines",
    "field_edits",
    "insert_lines",
    "replace_patterns",
    "reports",
];

/// The pass loop runs until a pass makes no change, up to this bound.
pub const MAX_EDIT_PASSES: usize = 4;

/// Host services the edit driver needs besides the file itself.
pub struct EditSession<'a> {
    pub locks: &'a LockManager,
    pub persistent_classes: Option<&'a PersistentClassStore>,
    /// Throttle for per-promise edit locks across agent runs.
    pub edit_ifelapsed_minutes: u64,
    pub expireafter_minutes: u64,
}

/// Run every promise of an `edit_line` bundle against the in-memory file.
/// `call_args` are the caller's bundle arguments, bound to the bundle's
/// formal parameters. The file is not saved here.
#[tracing::instrument(skip_all, level = "debug", fields(file = %edit_file.path.display()))]
pub fn schedule_edit_operations(
    policy: &Policy,
    ctx: &mut EvalContext,
    session: &EditSession,
    bundle_id: BundleId,
    call_args: &[Rval],
    edit_file: &mut EditFile,
    ifelapsed_minutes: u64,
    now: u64,
) -> EditResult<Outcome> {
    let bundle = policy.bundle(bundle_id);
    let filename = edit_file.path.display().to_string();

    let master_lock = format!("masterfilelock-{filename}");
    let guard = match session.locks.acquire(
        &master_lock,
        ifelapsed_minutes,
        session.expireafter_minutes,
        now,
    )? {
        Ok(guard) => guard,
        Err(denied) => {
            debug!(file = %filename, ?denied, "file edit lock unavailable");
            return Ok(Outcome::Skipped);
        }
    };

    ctx.push_bundle_frame_inherited(&bundle.ns, &bundle.name);
    bind_bundle_args(ctx, bundle, call_args);
    ctx.set_special("edit", "filename", Value::scalar(filename.clone()));

    let mut outcome = Outcome::Noop;
    let mut anchors_seen: HashMap<String, String> = HashMap::new();
    // Promises actuated earlier in this run; later passes must not
    // re-apply them.
    let mut done: HashSet<String> = HashSet::new();

    'passes: for pass in 1..=MAX_EDIT_PASSES {
        let mut changed_this_pass = false;

        for section_name in EDIT_SECTION_ORDER {
            let Some(section) = bundle.get_section(section_name) else {
                continue;
            };
            ctx.push_section_frame(section_name);

            for promise in &section.promises {
                let result = expand_promise(ctx, "edit_line", section_name, promise, |ctx, concrete| {
                    actuate_edit_promise(
                        policy,
                        ctx,
                        session,
                        section_name,
                        concrete,
                        edit_file,
                        &mut anchors_seen,
                        &mut done,
                        now,
                    )
                });
                if result >= Outcome::Change {
                    changed_this_pass = true;
                }
                // Lock-throttled skips on later passes are re-runs of
                // promises already accounted for.
                if pass == 1 || result != Outcome::Skipped {
                    outcome = outcome.and(result);
                }
                if ctx.bundle_aborted() {
                    let _ = ctx.pop_frame();
                    break 'passes;
                }
            }
            let _ = ctx.pop_frame();
        }

        debug!(pass, changed = changed_this_pass, file = %filename, "edit pass complete");
        if !changed_this_pass {
            break;
        }
    }

    let _ = ctx.pop_frame();
    session.locks.yield_lock(guard, now)?;
    Ok(outcome)
}

fn bind_bundle_args(ctx: &mut EvalContext, bundle: &Bundle, call_args: &[Rval]) {
    let bindings = crate::eval::vars::Bindings::new();
    let pairs: Vec<(String, Value)> = bundle
        .args
        .iter()
        .zip(call_args)
        .filter_map(|(formal, actual)| match actual {
            Rval::Scalar(s) => Some((
                formal.clone(),
                Value::Scalar(ctx.expand_scalar(s, &bindings)),
            )),
            Rval::List(items) => Some((
                formal.clone(),
                Value::List(
                    items
                        .iter()
                        .filter_map(Rval::as_scalar)
                        .map(|s| ctx.expand_scalar(s, &bindings))
                        .collect(),
                ),
            )),
            _ => None,
        })
        .collect();
    let ns = bundle.ns.clone();
    let scope = bundle.name.clone();
    for (name, value) in pairs {
        ctx.set_variable(&ns, &scope, &name, value);
    }
}

#[allow(clippy::too_many_arguments)]
fn actuate_edit_promise(
    policy: &Policy,
    ctx: &mut EvalContext,
    session: &EditSession,
    section_name: &str,
    promise: &Promise,
    edit_file: &mut EditFile,
    anchors_seen: &mut HashMap<String, String>,
    done: &mut HashSet<String>,
    now: u64,
) -> Outcome {
    match section_name {
        "vars" => return evaluate_vars_promise(ctx, promise),
        "classes" => {
            return evaluate_classes_promise(
                ctx,
                promise,
                "edit_line",
                session.persistent_classes,
                now,
            );
        }
        "reports" => {
            info!(report = %promise.promiser, "edit report");
            return Outcome::Noop;
        }
        _ => {}
    }

    let filename = edit_file.path.display().to_string();
    let lock_name = match section_name {
        "delete_lines" => format!("deleteline-{}-{}", promise.promiser, filename),
        "field_edits" => format!("column-{}-{}", promise.promiser, filename),
        "replace_patterns" => format!("replace-{}-{}", promise.promiser, filename),
        "insert_lines" => {
            if promise.constraint_as_scalar("insert_type") == Some("preserve_all_lines") {
                // Duplicates are promised on the first pass only.
                format!(
                    "insertline-{}-{}-{}",
                    promise.promiser, filename, promise.offset.line
                )
            } else {
                format!("insertline-{}-{}", promise.promiser, filename)
            }
        }
        other => {
            debug!(section = other, "unsupported edit section");
            return Outcome::Noop;
        }
    };

    if done.contains(&lock_name) {
        return Outcome::Skipped;
    }

    let guard = match session.locks.acquire(
        &lock_name,
        session.edit_ifelapsed_minutes,
        session.expireafter_minutes,
        now,
    ) {
        Ok(Ok(guard)) => guard,
        Ok(Err(LockDenied::RecentlyDone)) | Ok(Err(LockDenied::Held)) => {
            return Outcome::Skipped;
        }
        Err(e) => {
            warn!("lock store failure: {e}");
            return Outcome::Fail;
        }
    };

    let result = match section_name {
        "delete_lines" => {
            let attrs = delete_attrs(policy, ctx, promise);
            verify("delete_lines", promise, delete::verify_line_deletions(edit_file, &attrs, &promise.promiser))
        }
        "insert_lines" => match insert_attrs(policy, ctx, promise) {
            Ok(attrs) => {
                warn_on_reused_anchor(&attrs, promise, anchors_seen);
                verify(
                    "insert_lines",
                    promise,
                    insert::verify_line_insertions(edit_file, ctx, &attrs, &promise.promiser),
                )
            }
            Err(e) => {
                warn!(promiser = %promise.promiser, "{e}");
                Outcome::Fail
            }
        },
        "replace_patterns" => {
            let attrs = replace_attrs(policy, ctx, promise);
            verify(
                "replace_patterns",
                promise,
                replace::verify_patterns(edit_file, ctx, &attrs, &promise.promiser),
            )
        }
        "field_edits" => {
            let attrs = field_attrs(policy, ctx, promise);
            verify(
                "field_edits",
                promise,
                fields::verify_column_edits(edit_file, &attrs, &promise.promiser),
            )
        }
        _ => Outcome::Noop,
    };

    if let Err(e) = session.locks.yield_lock(guard, now) {
        warn!("could not yield edit lock: {e}");
    }
    done.insert(lock_name);
    result
}

/// Collapse actuator errors into a failed outcome with a log line.
fn verify(operation: &str, promise: &Promise, result: EditResult<Outcome>) -> Outcome {
    match result {
        Ok(outcome) => {
            debug!(operation, promiser = %promise.promiser, ?outcome, "edit promise evaluated");
            outcome
        }
        Err(e) => {
            warn!(operation, promiser = %promise.promiser, "edit promise failed: {e}");
            Outcome::Fail
        }
    }
}

/// Two promises anchored on the same locator line contradict one another.
fn warn_on_reused_anchor(
    attrs: &InsertAttrs,
    promise: &Promise,
    anchors_seen: &mut HashMap<String, String>,
) {
    if let Some(anchor) = &attrs.location.line_matching {
        match anchors_seen.get(anchor) {
            Some(previous) if previous != &promise.promiser => {
                warn!(
                    anchor = %anchor,
                    first = %previous,
                    second = %promise.promiser,
                    "two insertions anchored on the same line will fight each other"
                );
            }
            Some(_) => {}
            None => {
                anchors_seen.insert(anchor.clone(), promise.promiser.clone());
            }
        }
    }
}

fn region_attrs(policy: &Policy, ctx: &EvalContext, promise: &Promise) -> RegionAttrs {
    body_attributes(policy, ctx, promise, "select_region")
        .as_ref()
        .map(RegionAttrs::from_body)
        .unwrap_or_default()
}

fn line_select_from(policy: &Policy, ctx: &EvalContext, promise: &Promise, lval: &str) -> LineSelect {
    body_attributes(policy, ctx, promise, lval)
        .as_ref()
        .map(LineSelect::from_body)
        .unwrap_or_default()
}

fn delete_attrs(policy: &Policy, ctx: &EvalContext, promise: &Promise) -> DeleteAttrs {
    DeleteAttrs {
        region: region_attrs(policy, ctx, promise),
        not_matching: promise.constraint_as_bool("not_matching").unwrap_or(false),
        line_select: line_select_from(policy, ctx, promise, "delete_select"),
    }
}

fn insert_attrs(policy: &Policy, ctx: &EvalContext, promise: &Promise) -> EditResult<InsertAttrs> {
    let insert_type = match promise.constraint_as_scalar("insert_type") {
        None => InsertType::default(),
        Some(word) => word.parse().map_err(|_| EditError::BadAttribute {
            attribute: "insert_type".into(),
            value: word.to_string(),
        })?,
    };

    let match_policies = match promise.constraint_as_list("insert_match") {
        None => Vec::new(),
        Some(words) => parse_match_policies(&words)?,
    };

    let location = body_attributes(policy, ctx, promise, "location")
        .map(|body: ResolvedBody| {
            Ok::<LocationAttrs, EditError>(LocationAttrs {
                before_after: parse_word(&body, "before_after", EditOrder::default())?,
                first_last: parse_word(&body, "first_last", FirstLast::default())?,
                line_matching: body.scalar("select_line_matching").map(str::to_string),
            })
        })
        .transpose()?
        .unwrap_or_default();

    Ok(InsertAttrs {
        insert_type,
        match_policies,
        expand_scalars: promise.constraint_as_bool("expand_scalars").unwrap_or(false),
        location,
        line_select: line_select_from(policy, ctx, promise, "insert_select"),
        region: region_attrs(policy, ctx, promise),
    })
}

fn replace_attrs(policy: &Policy, ctx: &EvalContext, promise: &Promise) -> ReplaceAttrs {
    let body = body_attributes(policy, ctx, promise, "replace_with");
    ReplaceAttrs {
        region: region_attrs(policy, ctx, promise),
        replace_value: body
            .as_ref()
            .and_then(|b| b.scalar("replace_value"))
            .map(str::to_string),
        occurrences: body
            .as_ref()
            .and_then(|b| b.scalar("occurrences"))
            .and_then(|word| word.parse().ok())
            .unwrap_or(Occurrences::All),
    }
}

fn field_attrs(policy: &Policy, ctx: &EvalContext, promise: &Promise) -> FieldAttrs {
    let body = body_attributes(policy, ctx, promise, "edit_field").unwrap_or_default();
    FieldAttrs {
        region: region_attrs(policy, ctx, promise),
        field_separator: body.scalar("field_separator").map(str::to_string),
        select_field: body.integer("select_field"),
        value_separator: body
            .scalar("value_separator")
            .and_then(|s| s.chars().next()),
        field_operation: body
            .scalar("field_operation")
            .and_then(|word| word.parse().ok())
            .unwrap_or(FieldOperation::default()),
        field_value: body.scalar("field_value").map(str::to_string),
        extend_columns: body.boolean("extend_columns").unwrap_or(false),
        allow_blank_fields: body.boolean("allow_blank_fields").unwrap_or(false),
    }
}

fn parse_word<T: std::str::FromStr>(
    body: &ResolvedBody,
    attribute: &str,
    default: T,
) -> EditResult<T> {
    match body.scalar(attribute) {
        None => Ok(default),
        Some(word) => word.parse().map_err(|_| EditError::BadAttribute {
            attribute: attribute.to_string(),
            value: word.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DEFAULT_NAMESPACE;
    use crate::store::MemStore;
    use std::path::PathBuf;

    struct Fixture {
        policy: Policy,
        bundle: BundleId,
        locks: LockManager,
    }

    impl Fixture {
        fn new() -> Self {
            let mut policy = Policy::new();
            let bundle =
                policy.append_bundle(DEFAULT_NAMESPACE, "fix_config", "edit_line", vec![], None);
            Self {
                policy,
                bundle,
                locks: LockManager::new(Box::new(MemStore::new())),
            }
        }

        fn run(&self, content: &str) -> (EditFile, Outcome) {
            let mut ctx = EvalContext::new();
            let mut file = EditFile::from_content(PathBuf::from("/etc/app.conf"), content.into());
            let session = EditSession {
                locks: &self.locks,
                persistent_classes: None,
                edit_ifelapsed_minutes: 0,
                expireafter_minutes: 120,
            };
            let outcome = schedule_edit_operations(
                &self.policy,
                &mut ctx,
                &session,
                self.bundle,
                &[],
                &mut file,
                0,
                1000,
            )
            .unwrap();
            (file, outcome)
        }
    }

    #[test]
    fn sections_run_in_fixed_order() {
        // delete runs before insert regardless of declaration order.
        let mut fixture = Fixture::new();
        let insert = fixture.policy.append_section(fixture.bundle, "insert_lines");
        fixture.policy.append_promise(insert, "fresh=1", None, "any");
        let delete = fixture.policy.append_section(fixture.bundle, "delete_lines");
        fixture.policy.append_promise(delete, "stale=.*", None, "any");

        let (file, outcome) = fixture.run("stale=9\nkeep=1\n");
        assert_eq!(outcome, Outcome::Change);
        assert_eq!(file.lines, vec!["keep=1", "fresh=1"]);
    }

    #[test]
    fn classes_guard_edit_promises_within_the_bundle() {
        let mut fixture = Fixture::new();
        let classes = fixture.policy.append_section(fixture.bundle, "classes");
        fixture.policy.append_promise(classes, "wants_banner", None, "any");

        let insert = fixture.policy.append_section(fixture.bundle, "insert_lines");
        fixture
            .policy
            .append_promise(insert, "banner=on", None, "wants_banner");
        fixture
            .policy
            .append_promise(insert, "banner=off", None, "no_such_class");

        let (file, _) = fixture.run("");
        assert_eq!(file.lines, vec!["banner=on"]);
    }

    #[test]
    fn vars_expand_into_promisers() {
        let mut fixture = Fixture::new();
        let vars = fixture.policy.append_section(fixture.bundle, "vars");
        let var = fixture.policy.append_promise(vars, "port", None, "any");
        fixture
            .policy
            .append_promise_constraint(var, "string", Rval::scalar("8080"), false);

        let insert = fixture.policy.append_section(fixture.bundle, "insert_lines");
        fixture
            .policy
            .append_promise(insert, "listen=$(port)", None, "any");

        let (file, _) = fixture.run("");
        assert_eq!(file.lines, vec!["listen=8080"]);
    }

    #[test]
    fn pass_loop_does_not_duplicate_preserved_lines() {
        let mut fixture = Fixture::new();
        let insert = fixture.policy.append_section(fixture.bundle, "insert_lines");
        let promise = fixture.policy.append_promise(insert, "again", None, "any");
        fixture.policy.append_promise_constraint(
            promise,
            "insert_type",
            Rval::scalar("preserve_all_lines"),
            false,
        );

        // Pass one inserts and forces a second pass; the per-promise lock
        // throttles the second application.
        let (file, outcome) = fixture.run("");
        assert_eq!(file.lines, vec!["again"]);
        assert_eq!(outcome, Outcome::Change);
    }

    #[test]
    fn converged_file_stops_after_one_pass() {
        let mut fixture = Fixture::new();
        let insert = fixture.policy.append_section(fixture.bundle, "insert_lines");
        fixture.policy.append_promise(insert, "present", None, "any");

        let (file, outcome) = fixture.run("present\n");
        assert_eq!(outcome, Outcome::Noop);
        assert!(!file.modified());
    }

    #[test]
    fn master_lock_denial_skips_the_bundle() {
        let fixture = Fixture::new();
        // Hold the master lock as if another agent had it.
        let _held = fixture
            .locks
            .acquire("masterfilelock-/etc/app.conf", 0, 120, 990)
            .unwrap()
            .unwrap();

        let (_, outcome) = fixture.run("x\n");
        assert_eq!(outcome, Outcome::Skipped);
    }

    #[test]
    fn bundle_arguments_bind_as_variables() {
        let mut fixture = Fixture::new();
        fixture.policy.bundle_mut(fixture.bundle).args = vec!["setting".into()];
        let insert = fixture.policy.append_section(fixture.bundle, "insert_lines");
        fixture
            .policy
            .append_promise(insert, "$(setting)=yes", None, "any");

        let mut ctx = EvalContext::new();
        let mut file = EditFile::from_content(PathBuf::from("/etc/app.conf"), String::new());
        let session = EditSession {
            locks: &fixture.locks,
            persistent_classes: None,
            edit_ifelapsed_minutes: 0,
            expireafter_minutes: 120,
        };
        schedule_edit_operations(
            &fixture.policy,
            &mut ctx,
            &session,
            fixture.bundle,
            &[Rval::scalar("telemetry")],
            &mut file,
            0,
            1000,
        )
        .unwrap();
        assert_eq!(file.lines, vec!["telemetry=yes"]);
    }

    #[test]
    fn edit_scratch_scope_has_the_filename() {
        let mut fixture = Fixture::new();
        let insert = fixture.policy.append_section(fixture.bundle, "insert_lines");
        fixture
            .policy
            .append_promise(insert, "# managed: $(edit.filename)", None, "any");

        let (file, _) = fixture.run("");
        assert_eq!(file.lines, vec!["# managed: /etc/app.conf"]);
    }
}
