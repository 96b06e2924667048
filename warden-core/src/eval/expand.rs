//! Promise expansion: turning one policy promise into its concrete
//! instances. Iterable references (list-valued variables named in the
//! promiser or attribute scalars) form a Cartesian product; instances are
//! produced one at a time and handed to the actuator callback, so memory
//! stays proportional to one tuple rather than the whole product.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use super::classes::is_defined_class;
use super::vars::{Bindings, has_unexpanded};
use super::{EvalContext, Value};
use crate::outcome::Outcome;
use crate::policy::syntax::{self, DataKind};
use crate::policy::{FnCall, Promise, Rval};

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$[({]([a-zA-Z0-9_][a-zA-Z0-9_.:@]*)[)}]").unwrap()
    })
}

/// Names of variables referenced from a scalar, in order of appearance.
fn collect_refs_scalar(text: &str, out: &mut Vec<String>, seen: &mut HashSet<String>) {
    for captures in reference_pattern().captures_iter(text) {
        let name = captures[1].to_string();
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
}

fn collect_refs_rval(rval: &Rval, out: &mut Vec<String>, seen: &mut HashSet<String>) {
    match rval {
        Rval::Scalar(s) => collect_refs_scalar(s, out, seen),
        Rval::List(items) => {
            for item in items {
                collect_refs_rval(item, out, seen);
            }
        }
        Rval::FnCall(call) => {
            for arg in &call.args {
                collect_refs_rval(arg, out, seen);
            }
        }
        Rval::Container(_) => {}
    }
}

/// The list-valued variables a promise iterates over, with their elements
/// snapshotted at expansion time.
fn iterables(ctx: &EvalContext, promise: &Promise) -> Vec<(String, Vec<String>)> {
    let mut names = Vec::new();
    let mut seen = HashSet::new();

    collect_refs_scalar(&promise.promiser, &mut names, &mut seen);
    if let Some(promisee) = &promise.promisee {
        collect_refs_rval(promisee, &mut names, &mut seen);
    }
    for constraint in &promise.constraints {
        collect_refs_rval(&constraint.rval, &mut names, &mut seen);
    }

    names
        .into_iter()
        .filter_map(|name| match ctx.resolve_reference(&name) {
            Some(Value::List(items)) => Some((name, items)),
            _ => None,
        })
        .collect()
}

/// A tiny built-in function library, enough for guard logic. Anything else
/// stays unresolved and is re-examined by the pre-eval check.
pub fn evaluate_fncall(ctx: &EvalContext, call: &FnCall, bindings: &Bindings) -> Option<Rval> {
    let truth = |b: bool| Rval::scalar(if b { "true" } else { "false" });

    let scalar_args = || -> Option<Vec<String>> {
        call.args
            .iter()
            .map(|arg| match arg {
                Rval::Scalar(s) => Some(ctx.expand_scalar(s, bindings)),
                Rval::FnCall(inner) => evaluate_fncall(ctx, inner, bindings)
                    .and_then(|r| r.as_scalar().map(str::to_string)),
                _ => None,
            })
            .collect()
    };

    match call.name.as_str() {
        "and" => {
            let args = scalar_args()?;
            Some(truth(args.iter().all(|a| is_defined_class(ctx, a))))
        }
        "or" => {
            let args = scalar_args()?;
            Some(truth(args.iter().any(|a| is_defined_class(ctx, a))))
        }
        "not" => {
            let args = scalar_args()?;
            Some(truth(!is_defined_class(ctx, args.first()?)))
        }
        "concat" => Some(Rval::Scalar(scalar_args()?.concat())),
        "fileexists" => {
            let args = scalar_args()?;
            Some(truth(std::path::Path::new(args.first()?).exists()))
        }
        _ => None,
    }
}

/// Re-run the constraint type check on a concrete promise; values such as
/// `$(x)` may have resolved to a scalar of the wrong shape.
fn recheck_concrete(bundle_type: &str, section_type: &str, promise: &Promise) -> Result<(), String> {
    if !syntax::is_builtin_promise_type(section_type) {
        return Ok(());
    }
    for constraint in &promise.constraints {
        let Some(declared) = syntax::constraint_syntax(bundle_type, section_type, &constraint.lval)
        else {
            continue;
        };
        if !declared.dtype.accepts(&constraint.rval) {
            return Err(format!(
                "attribute '{}' expanded to a value incompatible with type {}",
                constraint.lval, declared.dtype
            ));
        }
        if let Rval::Scalar(scalar) = &constraint.rval {
            if has_unexpanded(scalar) {
                continue;
            }
            let numeric_ok = match declared.dtype {
                DataKind::Int => scalar.parse::<i64>().is_ok(),
                DataKind::Real => scalar.parse::<f64>().is_ok(),
                _ => true,
            };
            if !numeric_ok {
                return Err(format!(
                    "attribute '{}' expanded to '{}' which is not a {}",
                    constraint.lval, scalar, declared.dtype
                ));
            }
        }
    }
    Ok(())
}

/// Build the concrete instance of a promise under one set of bindings.
fn concretise(ctx: &EvalContext, promise: &Promise, bindings: &Bindings) -> Promise {
    let mut concrete = promise.clone();
    concrete.promiser = ctx.expand_scalar(&promise.promiser, bindings);
    concrete.classes = ctx.expand_scalar(&promise.classes, bindings);
    if let Some(promisee) = &promise.promisee {
        concrete.promisee = Some(ctx.expand_rval(promisee, bindings));
    }
    for constraint in &mut concrete.constraints {
        constraint.rval = ctx.expand_rval(&constraint.rval, bindings);
        if let Rval::FnCall(call) = &constraint.rval {
            if let Some(resolved) = evaluate_fncall(ctx, call, bindings) {
                constraint.rval = resolved;
                constraint.references_body = false;
            }
        }
    }
    concrete
}

/// Whether a concrete instance's guards let it run.
fn guards_hold(ctx: &EvalContext, concrete: &Promise) -> bool {
    if !is_defined_class(ctx, &concrete.classes) {
        return false;
    }
    for lval in ["if", "ifvarclass"] {
        if let Some(constraint) = concrete.get_constraint(lval) {
            match &constraint.rval {
                Rval::Scalar(expression) => {
                    if has_unexpanded(expression) {
                        debug!(
                            promiser = %concrete.promiser,
                            "skipping instance with unexpanded guard '{expression}'"
                        );
                        return false;
                    }
                    if !is_defined_class(ctx, expression) {
                        return false;
                    }
                }
                // An unresolved function call cannot be decided; skip.
                _ => return false,
            }
        }
    }
    true
}

/// Expand a promise and feed each runnable concrete instance to the
/// actuator. Returns the worst outcome over all instances; instances whose
/// guards do not hold contribute nothing.
#[tracing::instrument(skip_all, level = "debug", fields(promiser = %promise.promiser))]
pub fn expand_promise<F>(
    ctx: &mut EvalContext,
    bundle_type: &str,
    section_type: &str,
    promise: &Promise,
    mut actuator: F,
) -> Outcome
where
    F: FnMut(&mut EvalContext, &Promise) -> Outcome,
{
    let iterables = iterables(ctx, promise);
    if iterables.iter().any(|(_, items)| items.is_empty()) {
        debug!(promiser = %promise.promiser, "iterating over an empty list, nothing to do");
        return Outcome::Noop;
    }
    let mut outcome = Outcome::Noop;

    // Odometer over the Cartesian product; no iterables means one instance.
    let mut indices = vec![0usize; iterables.len()];
    loop {
        let mut bindings = Bindings::new();
        for (slot, (name, items)) in iterables.iter().enumerate() {
            bindings.insert(name.clone(), items[indices[slot]].clone());
        }

        ctx.push_private_class_frame();
        let concrete = concretise(ctx, promise, &bindings);

        if guards_hold(ctx, &concrete) {
            match recheck_concrete(bundle_type, section_type, &concrete) {
                Ok(()) => {
                    ctx.push_promise_frame(&concrete.promiser);
                    let result = actuator(ctx, &concrete);
                    outcome = outcome.and(result);
                    let _ = ctx.pop_frame();
                }
                Err(reason) => {
                    warn!(promiser = %concrete.promiser, "{reason}");
                    outcome = outcome.and(Outcome::Fail);
                }
            }
        }
        let _ = ctx.pop_frame(); // private classes

        if ctx.bundle_aborted() {
            break;
        }

        // Advance the odometer; empty iterables end the loop immediately.
        let mut position = indices.len();
        loop {
            if position == 0 {
                return outcome;
            }
            position -= 1;
            indices[position] += 1;
            if indices[position] < iterables[position].1.len() {
                break;
            }
            indices[position] = 0;
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::ClassScope;
    use crate::policy::{DEFAULT_NAMESPACE, Policy, PromiseRef};

    fn files_promise(policy: &mut Policy, promiser: &str) -> PromiseRef {
        let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "main", "agent", vec![], None);
        let section = policy.append_section(bundle, "files");
        policy.append_promise(section, promiser, None, "any")
    }

    fn collect_instances(ctx: &mut EvalContext, promise: &Promise) -> Vec<String> {
        let mut seen = Vec::new();
        expand_promise(ctx, "agent", "files", promise, |_ctx, concrete| {
            seen.push(concrete.promiser.clone());
            Outcome::Noop
        });
        seen
    }

    #[test]
    fn plain_promise_expands_to_itself() {
        let mut policy = Policy::new();
        let promise_ref = files_promise(&mut policy, "/etc/motd");
        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame(DEFAULT_NAMESPACE, "main");
        let seen = collect_instances(&mut ctx, policy.promise(promise_ref));
        assert_eq!(seen, vec!["/etc/motd"]);
    }

    #[test]
    fn list_variable_in_promiser_iterates() {
        let mut policy = Policy::new();
        let promise_ref = files_promise(&mut policy, "/srv/$(site)/config");
        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame(DEFAULT_NAMESPACE, "main");
        ctx.set_variable(
            DEFAULT_NAMESPACE,
            "main",
            "site",
            Value::List(vec!["alpha".into(), "beta".into()]),
        );

        let seen = collect_instances(&mut ctx, policy.promise(promise_ref));
        assert_eq!(seen, vec!["/srv/alpha/config", "/srv/beta/config"]);
    }

    #[test]
    fn two_lists_form_a_cartesian_product() {
        let mut policy = Policy::new();
        let promise_ref = files_promise(&mut policy, "$(host):$(port)");
        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame(DEFAULT_NAMESPACE, "main");
        ctx.set_variable(
            DEFAULT_NAMESPACE,
            "main",
            "host",
            Value::List(vec!["a".into(), "b".into()]),
        );
        ctx.set_variable(
            DEFAULT_NAMESPACE,
            "main",
            "port",
            Value::List(vec!["80".into(), "443".into()]),
        );

        let seen = collect_instances(&mut ctx, policy.promise(promise_ref));
        assert_eq!(seen, vec!["a:80", "a:443", "b:80", "b:443"]);
    }

    #[test]
    fn empty_list_yields_no_instances() {
        let mut policy = Policy::new();
        let promise_ref = files_promise(&mut policy, "/x/$(none)");
        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame(DEFAULT_NAMESPACE, "main");
        ctx.set_variable(DEFAULT_NAMESPACE, "main", "none", Value::List(vec![]));

        let seen = collect_instances(&mut ctx, policy.promise(promise_ref));
        assert!(seen.is_empty());
    }

    #[test]
    fn scalar_variables_expand_without_iterating() {
        let mut policy = Policy::new();
        let promise_ref = files_promise(&mut policy, "$(prefix)/motd");
        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame(DEFAULT_NAMESPACE, "main");
        ctx.set_variable(DEFAULT_NAMESPACE, "main", "prefix", Value::scalar("/etc"));

        let seen = collect_instances(&mut ctx, policy.promise(promise_ref));
        assert_eq!(seen, vec!["/etc/motd"]);
    }

    #[test]
    fn class_guard_filters_instances() {
        let mut policy = Policy::new();
        let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "main", "agent", vec![], None);
        let section = policy.append_section(bundle, "files");
        let promise_ref = policy.append_promise(section, "/guarded", None, "role_$(n)");

        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame(DEFAULT_NAMESPACE, "main");
        ctx.set_variable(
            DEFAULT_NAMESPACE,
            "main",
            "n",
            Value::List(vec!["1".into(), "2".into()]),
        );
        ctx.add_class("role_2", ClassScope::Global);

        let mut count = 0;
        expand_promise(&mut ctx, "agent", "files", policy.promise(promise_ref), |_c, p| {
            assert_eq!(p.classes, "role_2");
            count += 1;
            Outcome::Noop
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn if_guard_with_fncall_resolves() {
        let mut policy = Policy::new();
        let promise_ref = files_promise(&mut policy, "/x");
        policy.append_promise_constraint(
            promise_ref,
            "if",
            Rval::FnCall(FnCall {
                name: "and".into(),
                args: vec![Rval::scalar("any"), Rval::scalar("linux")],
            }),
            false,
        );

        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame(DEFAULT_NAMESPACE, "main");
        let seen = collect_instances(&mut ctx, policy.promise(promise_ref));
        assert!(seen.is_empty());

        ctx.add_class("linux", ClassScope::Global);
        let seen = collect_instances(&mut ctx, policy.promise(promise_ref));
        assert_eq!(seen, vec!["/x"]);
    }

    #[test]
    fn unexpanded_if_guard_skips_instance() {
        let mut policy = Policy::new();
        let promise_ref = files_promise(&mut policy, "/x");
        policy.append_promise_constraint(promise_ref, "if", Rval::scalar("$(undefined_var)"), false);

        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame(DEFAULT_NAMESPACE, "main");
        let seen = collect_instances(&mut ctx, policy.promise(promise_ref));
        assert!(seen.is_empty());
    }

    #[test]
    fn recheck_flags_badly_typed_expansion() {
        let mut policy = Policy::new();
        let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "main", "agent", vec![], None);
        let section = policy.append_section(bundle, "vars");
        let promise_ref = policy.append_promise(section, "count", None, "any");
        policy.append_promise_constraint(promise_ref, "int", Rval::scalar("$(value)"), false);

        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame(DEFAULT_NAMESPACE, "main");
        ctx.set_variable(DEFAULT_NAMESPACE, "main", "value", Value::scalar("many"));

        let outcome = expand_promise(
            &mut ctx,
            "agent",
            "vars",
            policy.promise(promise_ref),
            |_c, _p| Outcome::Noop,
        );
        assert_eq!(outcome, Outcome::Fail);
    }

    #[test]
    fn this_promiser_is_bound_during_actuation() {
        let mut policy = Policy::new();
        let promise_ref = files_promise(&mut policy, "/etc/motd");
        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame(DEFAULT_NAMESPACE, "main");

        expand_promise(&mut ctx, "agent", "files", policy.promise(promise_ref), |c, _p| {
            assert_eq!(
                c.resolve_reference("this.promiser"),
                Some(Value::scalar("/etc/motd"))
            );
            Outcome::Noop
        });
    }
}
