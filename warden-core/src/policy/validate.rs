//! Semantic validation of a policy: duplicate definitions, unknown
//! attributes, type mismatches, dangling body references, handle clashes.
//! Errors are collected in order, never short-circuited, so repeated runs
//! over the same policy produce the same report.

use std::collections::HashMap;
use std::fmt;

use super::syntax::{self, DataKind};
use super::{Body, Bundle, Policy, Promise, SourceOffset, split_qualified};

/// Bundle names that would shadow built-in variable scopes.
pub const RESERVED_BUNDLE_NAMES: &[&str] = &["sys", "const", "mon", "edit", "match", "this"];

/// Attributes rejected on custom promise types, with their replacements.
const CUSTOM_PROMISE_UNSUPPORTED: &[&str] = &["action_policy", "expireafter", "meta"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Bundle,
    Body,
    Section,
    Promise,
    Constraint,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::Bundle => "bundle",
            ElementKind::Body => "body",
            ElementKind::Section => "section",
            ElementKind::Promise => "promise",
            ElementKind::Constraint => "constraint",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyIssue {
    pub element: ElementKind,
    pub source_path: Option<String>,
    pub offset: SourceOffset,
    pub message: String,
}

impl fmt::Display for PolicyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: error: {}",
            self.source_path.as_deref().unwrap_or("(unknown)"),
            self.offset.line,
            self.offset.column,
            self.message
        )
    }
}

/// Ordered list of everything wrong with a policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub issues: Vec<PolicyIssue>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    fn push(
        &mut self,
        element: ElementKind,
        source_path: Option<&str>,
        offset: SourceOffset,
        message: String,
    ) {
        self.issues.push(PolicyIssue {
            element,
            source_path: source_path.map(str::to_string),
            offset,
            message,
        });
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

/// Checks valid on any policy fragment, before merging.
pub fn check_partial(policy: &Policy) -> ValidationReport {
    let mut report = ValidationReport::default();

    check_duplicate_bundles(policy, &mut report);
    for bundle in &policy.bundles {
        check_bundle(policy, bundle, &mut report);
    }
    check_duplicate_bodies(policy, &mut report);
    for body in &policy.bodies {
        check_body(body, &mut report);
    }
    check_duplicate_handles(policy, &mut report);

    report
}

/// Checks that need the fully merged policy: cross-references and
/// control-driven requirements. Runs the partial pass first.
pub fn check_runnable(policy: &Policy) -> ValidationReport {
    let mut report = check_partial(policy);
    check_undefined_bodies(policy, &mut report);
    check_required_comments(policy, &mut report);
    report
}

fn check_duplicate_bundles(policy: &Policy, report: &mut ValidationReport) {
    for (i, bundle) in policy.bundles.iter().enumerate() {
        if !syntax::is_builtin_bundle_type(&bundle.bundle_type) {
            continue;
        }
        let duplicated = policy.bundles[..i].iter().any(|other| {
            other.bundle_type == bundle.bundle_type
                && other.ns == bundle.ns
                && other.name == bundle.name
        });
        if duplicated {
            report.push(
                ElementKind::Bundle,
                bundle.source_path.as_deref(),
                bundle.offset,
                format!(
                    "duplicate definition of bundle {} with type {}",
                    bundle.name, bundle.bundle_type
                ),
            );
        }
    }
}

fn check_duplicate_bodies(policy: &Policy, report: &mut ValidationReport) {
    for (i, body) in policy.bodies.iter().enumerate() {
        if body.body_type == "file" {
            continue;
        }
        let duplicated = policy.bodies[..i].iter().any(|other| {
            other.body_type == body.body_type && other.ns == body.ns && other.name == body.name
        });
        if duplicated {
            report.push(
                ElementKind::Body,
                body.source_path.as_deref(),
                body.offset,
                format!(
                    "duplicate definition of body {} with type {}",
                    body.name, body.body_type
                ),
            );
        }
    }
}

fn check_bundle(policy: &Policy, bundle: &Bundle, report: &mut ValidationReport) {
    if RESERVED_BUNDLE_NAMES.contains(&bundle.name.as_str()) {
        report.push(
            ElementKind::Bundle,
            bundle.source_path.as_deref(),
            bundle.offset,
            format!("bundle name '{}' is a reserved word", bundle.name),
        );
    }

    for section in bundle.sections.iter().chain(bundle.custom_sections.iter()) {
        for promise in &section.promises {
            check_promise(policy, bundle, &section.promise_type, promise, report);
        }
    }
}

fn check_promise(
    _policy: &Policy,
    bundle: &Bundle,
    promise_type: &str,
    promise: &Promise,
    report: &mut ValidationReport,
) {
    if promise.promiser.is_empty() || promise.promiser == "$()" || promise.promiser == "${}" {
        report.push(
            ElementKind::Promise,
            bundle.source_path.as_deref(),
            promise.offset,
            "promiser is an empty variable reference".to_string(),
        );
    }

    if syntax::is_builtin_promise_type(promise_type) {
        if syntax::promise_type_syntax(&bundle.bundle_type, promise_type).is_none() {
            report.push(
                ElementKind::Section,
                bundle.source_path.as_deref(),
                promise.offset,
                format!(
                    "promise type {} is not supported in bundles of type {}",
                    promise_type, bundle.bundle_type
                ),
            );
            return;
        }

        for constraint in &promise.constraints {
            match syntax::constraint_syntax(&bundle.bundle_type, promise_type, &constraint.lval) {
                None => report.push(
                    ElementKind::Constraint,
                    bundle.source_path.as_deref(),
                    constraint.offset,
                    format!(
                        "invalid attribute '{}' for promise type {}",
                        constraint.lval, promise_type
                    ),
                ),
                Some(declared) => {
                    if !declared.dtype.accepts(&constraint.rval) {
                        report.push(
                            ElementKind::Constraint,
                            bundle.source_path.as_deref(),
                            constraint.offset,
                            format!(
                                "right-value of attribute '{}' does not match its declared type {}",
                                constraint.lval, declared.dtype
                            ),
                        );
                    }
                }
            }
        }
    } else {
        check_custom_promise(bundle, promise_type, promise, report);
    }
}

/// Custom promise types talk to an external module; a handful of classic
/// attributes are rejected there to force the migration to `if`.
fn check_custom_promise(
    bundle: &Bundle,
    promise_type: &str,
    promise: &Promise,
    report: &mut ValidationReport,
) {
    for constraint in &promise.constraints {
        if constraint.lval == "ifvarclass" {
            report.push(
                ElementKind::Promise,
                bundle.source_path.as_deref(),
                constraint.offset,
                format!(
                    "attribute 'ifvarclass' is not supported for custom promise type {promise_type}, use 'if'"
                ),
            );
        } else if CUSTOM_PROMISE_UNSUPPORTED.contains(&constraint.lval.as_str()) {
            report.push(
                ElementKind::Promise,
                bundle.source_path.as_deref(),
                constraint.offset,
                format!(
                    "attribute '{}' is not implemented for custom promise type {promise_type}",
                    constraint.lval
                ),
            );
        }
    }
}

fn check_body(body: &Body, report: &mut ValidationReport) {
    if body.name == "control" && !body.args.is_empty() {
        report.push(
            ElementKind::Body,
            body.source_path.as_deref(),
            body.offset,
            format!("control body for {} must not take arguments", body.body_type),
        );
    }

    if let Some(table) = syntax::body_syntax(&body.body_type) {
        for constraint in &body.constraints {
            match table.constraints.iter().find(|c| c.lval == constraint.lval) {
                None => report.push(
                    ElementKind::Constraint,
                    body.source_path.as_deref(),
                    constraint.offset,
                    format!(
                        "invalid attribute '{}' in body of type {}",
                        constraint.lval, body.body_type
                    ),
                ),
                Some(declared) => {
                    if !declared.dtype.accepts(&constraint.rval) {
                        report.push(
                            ElementKind::Constraint,
                            body.source_path.as_deref(),
                            constraint.offset,
                            format!(
                                "right-value of attribute '{}' does not match its declared type {}",
                                constraint.lval, declared.dtype
                            ),
                        );
                    }
                }
            }
        }
    }
}

fn check_undefined_bodies(policy: &Policy, report: &mut ValidationReport) {
    for (bundle, section, promise) in policy.promises() {
        for constraint in &promise.constraints {
            let Some(declared) =
                syntax::constraint_syntax(&bundle.bundle_type, &section.promise_type, &constraint.lval)
            else {
                continue;
            };
            if declared.dtype != DataKind::Body {
                continue;
            }
            let Some(symbol) = constraint.rval.full_symbol() else {
                continue;
            };
            let (ns, bare) = split_qualified(symbol);
            let ns = ns.or(Some(bundle.ns.as_str()));
            if policy.get_body(ns, &constraint.lval, bare).is_none() {
                report.push(
                    ElementKind::Constraint,
                    bundle.source_path.as_deref(),
                    constraint.offset,
                    format!(
                        "undefined body {} with type {}",
                        bare, constraint.lval
                    ),
                );
            }
        }
    }
}

fn check_required_comments(policy: &Policy, report: &mut ValidationReport) {
    let Some(control) = policy.common_control() else {
        return;
    };
    if control.constraint_as_bool("require_comments") != Some(true) {
        return;
    }

    for (bundle, _section, promise) in policy.promises() {
        let has_comment =
            promise.comment.is_some() || promise.get_constraint("comment").is_some();
        if !has_comment {
            report.push(
                ElementKind::Promise,
                bundle.source_path.as_deref(),
                promise.offset,
                format!("promise '{}' is uncommented", promise.promiser),
            );
        }
    }
}

fn check_duplicate_handles(policy: &Policy, report: &mut ValidationReport) {
    let mut recorded: HashMap<&str, &Promise> = HashMap::new();

    for (bundle, _section, promise) in policy.promises() {
        let Some(handle) = promise.handle() else {
            continue;
        };
        // Dynamic handles cannot be compared before expansion.
        if handle.contains("$(") || handle.contains("${") {
            continue;
        }
        match recorded.get(handle) {
            Some(other) if other.classes == promise.classes => {
                report.push(
                    ElementKind::Promise,
                    bundle.source_path.as_deref(),
                    promise.offset,
                    format!("duplicate promise handle '{handle}'"),
                );
            }
            Some(_) => {}
            None => {
                recorded.insert(handle, promise);
            }
        }
    }
}
