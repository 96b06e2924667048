//! Resolution of promise attributes into effective values: body references
//! are followed, body arguments substituted, and class-guarded constraints
//! filtered against the evaluation context.

use super::classes::is_defined_class;
use super::vars::Bindings;
use super::EvalContext;
use crate::policy::{parse_bool, Body, Policy, Promise, Rval};

/// A body dereferenced on behalf of one promise: its constraints with
/// arguments substituted and guards applied.
#[derive(Debug, Clone, Default)]
pub struct ResolvedBody {
    entries: Vec<(String, Rval)>,
}

impl ResolvedBody {
    pub fn get(&self, lval: &str) -> Option<&Rval> {
        // First matching entry wins; guarded duplicates were filtered
        // before insertion.
        self.entries
            .iter()
            .find(|(name, _)| name == lval)
            .map(|(_, rval)| rval)
    }

    pub fn scalar(&self, lval: &str) -> Option<&str> {
        self.get(lval).and_then(Rval::as_scalar)
    }

    pub fn boolean(&self, lval: &str) -> Option<bool> {
        self.scalar(lval).and_then(parse_bool)
    }

    pub fn integer(&self, lval: &str) -> Option<i64> {
        self.scalar(lval).and_then(|s| s.parse().ok())
    }

    pub fn list(&self, lval: &str) -> Option<Vec<String>> {
        match self.get(lval)? {
            Rval::Scalar(s) => Some(vec![s.clone()]),
            Rval::List(items) => Some(
                items
                    .iter()
                    .filter_map(Rval::as_scalar)
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Follow a body-reference attribute of a promise. Returns `None` when the
/// promise does not carry the attribute or the body does not exist.
pub fn body_attributes(
    policy: &Policy,
    ctx: &EvalContext,
    promise: &Promise,
    lval: &str,
) -> Option<ResolvedBody> {
    let constraint = promise.get_constraint(lval)?;

    let (symbol, args): (&str, Vec<Rval>) = match &constraint.rval {
        Rval::Scalar(s) => (s.as_str(), Vec::new()),
        Rval::FnCall(call) => (call.name.as_str(), call.args.clone()),
        _ => return None,
    };

    let section = policy.section(promise.parent);
    let bundle = policy.bundle(section.parent);
    let body = policy.get_body(Some(&bundle.ns), lval, symbol)?;

    Some(resolve_body(ctx, body, &args))
}

/// Substitute positional arguments into a body's formal parameters and keep
/// the constraints whose class guard currently holds.
pub fn resolve_body(ctx: &EvalContext, body: &Body, args: &[Rval]) -> ResolvedBody {
    let mut bindings = Bindings::new();
    for (param, arg) in body.args.iter().zip(args) {
        if let Some(value) = arg.as_scalar() {
            bindings.insert(param.clone(), ctx.expand_scalar(value, &Bindings::new()));
        }
    }

    let mut resolved = ResolvedBody::default();
    for constraint in &body.constraints {
        if !is_defined_class(ctx, &constraint.classes) {
            continue;
        }
        if resolved.entries.iter().any(|(name, _)| name == &constraint.lval) {
            continue;
        }
        resolved
            .entries
            .push((constraint.lval.clone(), ctx.expand_rval(&constraint.rval, &bindings)));
    }
    resolved
}
