//! The class algebra: parsing and evaluating boolean expressions over class
//! names, the `classes` promise actuator, and the persistent-class store.
//!
//! Grammar: `!` binds tightest, then `&` (with `.` as an alias), then `|`;
//! parentheses group; `any`/`true` and `false` are constants.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::multispace0,
    combinator::map,
    multi::many0,
    sequence::{delimited, preceded},
};
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

use super::{ClassScope, EvalContext, EvalError, EvalResult};
use crate::outcome::Outcome;
use crate::policy::{Promise, Rval};
use crate::store::KvStore;

#[derive(Debug, Clone, PartialEq)]
pub enum ClassExpr {
    Name(String),
    Not(Box<ClassExpr>),
    And(Box<ClassExpr>, Box<ClassExpr>),
    Or(Box<ClassExpr>, Box<ClassExpr>),
}

/// Parse a class guard; the whole input must be consumed.
pub fn parse_class_expression(input: &str) -> EvalResult<ClassExpr> {
    match or_expr(input.trim()) {
        Ok(("", expr)) => Ok(expr),
        Ok((rest, _)) => Err(EvalError::BadClassExpression {
            expression: input.to_string(),
            reason: format!("trailing input '{rest}'"),
        }),
        Err(e) => Err(EvalError::BadClassExpression {
            expression: input.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn or_expr(input: &str) -> IResult<&str, ClassExpr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(
        delimited(multispace0, alt((tag("||"), tag("|"))), multispace0),
        and_expr,
    ))(input)?;
    Ok((input, rest.into_iter().fold(first, |acc, e| {
        ClassExpr::Or(Box::new(acc), Box::new(e))
    })))
}

fn and_expr(input: &str) -> IResult<&str, ClassExpr> {
    let (input, first) = not_expr(input)?;
    let (input, rest) = many0(preceded(
        delimited(multispace0, alt((tag("&&"), tag("&"), tag("."))), multispace0),
        not_expr,
    ))(input)?;
    Ok((input, rest.into_iter().fold(first, |acc, e| {
        ClassExpr::And(Box::new(acc), Box::new(e))
    })))
}

fn not_expr(input: &str) -> IResult<&str, ClassExpr> {
    alt((
        map(preceded(tag("!"), not_expr), |e| ClassExpr::Not(Box::new(e))),
        atom,
    ))(input)
}

fn atom(input: &str) -> IResult<&str, ClassExpr> {
    alt((
        delimited(
            preceded(multispace0, tag("(")),
            delimited(multispace0, or_expr, multispace0),
            tag(")"),
        ),
        map(class_name, |name: &str| ClassExpr::Name(name.to_string())),
    ))(input)
}

fn class_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '@')(input)
}

fn eval_expr(ctx: &EvalContext, expr: &ClassExpr) -> bool {
    match expr {
        ClassExpr::Name(name) => match name.as_str() {
            "any" | "true" => true,
            "false" => false,
            _ => ctx.class_defined(name),
        },
        ClassExpr::Not(inner) => !eval_expr(ctx, inner),
        ClassExpr::And(a, b) => eval_expr(ctx, a) && eval_expr(ctx, b),
        ClassExpr::Or(a, b) => eval_expr(ctx, a) || eval_expr(ctx, b),
    }
}

/// Evaluate a class guard against the context. A malformed expression is
/// logged and treated as undefined.
pub fn is_defined_class(ctx: &EvalContext, expression: &str) -> bool {
    match parse_class_expression(expression) {
        Ok(expr) => eval_expr(ctx, &expr),
        Err(e) => {
            warn!("{e}");
            false
        }
    }
}

/// A single class name is valid when it parses as a bare expression.
pub fn valid_class_name(name: &str) -> bool {
    parse_class_expression(name).is_ok()
}

/// Replace characters illegal in class identifiers with underscores.
pub fn canonify(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

// ---- persistent classes -------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum StatePolicy {
    /// Keep the original expiry when the class is saved again.
    Preserve,
    /// Restart the clock on every save.
    Reset,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PersistentRecord {
    expires: u64,
    policy: String,
}

/// Durable classes that outlive a single run, keyed by class name with a
/// time-to-live.
pub struct PersistentClassStore {
    store: Box<dyn KvStore>,
}

impl PersistentClassStore {
    pub fn new(store: Box<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn save(
        &self,
        name: &str,
        ttl_minutes: u64,
        policy: StatePolicy,
        now: u64,
    ) -> EvalResult<()> {
        if policy == StatePolicy::Preserve {
            if let Some(bytes) = self.store.get(name.as_bytes())? {
                if let Ok(existing) = serde_json::from_slice::<PersistentRecord>(&bytes) {
                    if existing.expires > now {
                        return Ok(());
                    }
                }
            }
        }
        let record = PersistentRecord {
            expires: now + ttl_minutes * 60,
            policy: policy.to_string(),
        };
        let bytes = serde_json::to_vec(&record).unwrap_or_default();
        self.store.put(name.as_bytes(), &bytes)?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> EvalResult<()> {
        self.store.delete(name.as_bytes())?;
        Ok(())
    }

    /// Purge expired entries and define the survivors in the global heap.
    pub fn load(&self, ctx: &mut EvalContext, now: u64) -> EvalResult<()> {
        for (key, value) in self.store.scan_prefix(b"")? {
            let name = String::from_utf8_lossy(&key).to_string();
            match serde_json::from_slice::<PersistentRecord>(&value) {
                Ok(record) if record.expires > now => {
                    debug!(class = %name, "restoring persistent class");
                    ctx.add_class(&name, ClassScope::Global);
                }
                _ => {
                    self.store.delete(&key)?;
                }
            }
        }
        Ok(())
    }
}

// ---- the classes promise ------------------------------------------------

const CONTEXT_LVALS: &[&str] = &["expression", "not", "and", "or", "xor"];

fn list_combination(ctx: &EvalContext, rval: &Rval, lval: &str) -> bool {
    let items: Vec<&str> = match rval {
        Rval::List(items) => items.iter().filter_map(Rval::as_scalar).collect(),
        // A lone scalar is tolerated as a one-element list.
        Rval::Scalar(s) => vec![s.as_str()],
        _ => return false,
    };
    match lval {
        "or" => items.iter().any(|c| is_defined_class(ctx, c)),
        "and" => !items.is_empty() && items.iter().all(|c| is_defined_class(ctx, c)),
        "xor" => items.iter().fold(false, |acc, c| acc ^ is_defined_class(ctx, c)),
        _ => false,
    }
}

/// Actuate one `classes` promise: decide whether the promised class becomes
/// defined, and in which heap.
pub fn evaluate_classes_promise(
    ctx: &mut EvalContext,
    promise: &Promise,
    bundle_type: &str,
    persistent: Option<&PersistentClassStore>,
    now: u64,
) -> Outcome {
    let mut name = promise.promiser.clone();
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        debug!(class = %name, "class identifier contains illegal characters, canonifying");
        name = canonify(&name);
    }

    let context_constraints: Vec<_> = promise
        .constraints
        .iter()
        .filter(|c| CONTEXT_LVALS.contains(&c.lval.as_str()))
        .collect();

    if context_constraints.len() > 1 {
        warn!(class = %name, "irreconcilable constraints in classes promise");
        return Outcome::Fail;
    }

    let holds = match context_constraints.first() {
        None => true,
        Some(constraint) => match constraint.lval.as_str() {
            "expression" => constraint
                .rval
                .as_scalar()
                .map(|e| is_defined_class(ctx, e))
                .unwrap_or(false),
            "not" => constraint
                .rval
                .as_scalar()
                .map(|e| !is_defined_class(ctx, e))
                .unwrap_or(false),
            lval => list_combination(ctx, &constraint.rval, lval),
        },
    };

    let persistence = promise.constraint_as_int("persistence");

    if ctx.class_defined(&name) {
        // Cancel a cached persistent class on an explicit persistence of 0.
        if persistence == Some(0) {
            if let Some(store) = persistent {
                debug!(class = %name, "cancelling cached persistent class");
                let _ = store.remove(&name);
            }
        }
        return Outcome::Noop;
    }

    if !holds {
        return Outcome::Noop;
    }

    if !valid_class_name(&name) {
        warn!(class = %name, "illegal class identifier");
        return Outcome::Fail;
    }

    let persistence_minutes = persistence.filter(|m| *m > 0);
    let scope = match promise.constraint_as_scalar("scope") {
        Some("namespace") => ClassScope::Global,
        Some("bundle") => ClassScope::Bundle,
        _ if persistence_minutes.is_some() => ClassScope::Global,
        _ if bundle_type == "common" => ClassScope::Global,
        _ => ClassScope::Bundle,
    };

    ctx.add_class(&name, scope);

    if let (Some(minutes), Some(store)) = (persistence_minutes, persistent) {
        debug!(class = %name, minutes, "saving persistent class");
        if let Err(e) = store.save(&name, minutes as u64, StatePolicy::Reset, now) {
            warn!("could not persist class '{name}': {e}");
        }
    }

    Outcome::Noop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{DEFAULT_NAMESPACE, Policy};
    use crate::store::MemStore;

    fn ctx_with(classes: &[&str]) -> EvalContext {
        let mut ctx = EvalContext::new();
        for class in classes {
            ctx.add_class(class, ClassScope::Global);
        }
        ctx
    }

    #[test]
    fn single_names_and_constants() {
        let ctx = ctx_with(&["linux"]);
        assert!(is_defined_class(&ctx, "any"));
        assert!(is_defined_class(&ctx, "true"));
        assert!(!is_defined_class(&ctx, "false"));
        assert!(is_defined_class(&ctx, "linux"));
        assert!(!is_defined_class(&ctx, "windows"));
    }

    #[test]
    fn operators_and_precedence() {
        let ctx = ctx_with(&["a", "b"]);
        assert!(is_defined_class(&ctx, "a&b"));
        assert!(is_defined_class(&ctx, "a.b"));
        assert!(is_defined_class(&ctx, "a|c"));
        assert!(!is_defined_class(&ctx, "a&c"));
        assert!(is_defined_class(&ctx, "!c"));
        assert!(is_defined_class(&ctx, "!!a"));
        // & binds tighter than |
        assert!(is_defined_class(&ctx, "c&d|a"));
        assert!(!is_defined_class(&ctx, "c&(d|a)"));
        assert!(is_defined_class(&ctx, "(a|c)&b"));
        assert!(is_defined_class(&ctx, "a && b"));
        assert!(is_defined_class(&ctx, "a || c"));
    }

    #[test]
    fn negation_law() {
        let ctx = ctx_with(&["x"]);
        for class in ["x", "y", "x&y", "x|y"] {
            let positive = is_defined_class(&ctx, class);
            let negative = is_defined_class(&ctx, &format!("!({class})"));
            assert_ne!(positive, negative, "law failed for {class}");
        }
    }

    #[test]
    fn malformed_expressions_are_undefined() {
        let ctx = ctx_with(&["a"]);
        assert!(!is_defined_class(&ctx, "a&"));
        assert!(!is_defined_class(&ctx, "(a"));
        assert!(!is_defined_class(&ctx, "$(unexpanded)"));
        assert!(!is_defined_class(&ctx, ""));
    }

    #[test]
    fn canonify_replaces_illegal_characters() {
        assert_eq!(canonify("web-01.example"), "web_01_example");
        assert_eq!(canonify("ok_name9"), "ok_name9");
    }

    fn classes_promise(policy: &mut Policy, promiser: &str) -> crate::policy::PromiseRef {
        let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "b", "agent", vec![], None);
        let section = policy.append_section(bundle, "classes");
        policy.append_promise(section, promiser, None, "any")
    }

    #[test]
    fn bare_classes_promise_defines_bundle_class() {
        let mut policy = Policy::new();
        let promise_ref = classes_promise(&mut policy, "role_2");
        let mut ctx = EvalContext::new();
        let outcome =
            evaluate_classes_promise(&mut ctx, policy.promise(promise_ref), "agent", None, 0);
        assert_eq!(outcome, Outcome::Noop);
        assert!(ctx.class_defined("role_2"));
    }

    #[test]
    fn expression_constraint_gates_definition() {
        let mut policy = Policy::new();
        let promise_ref = classes_promise(&mut policy, "wanted");
        policy.append_promise_constraint(promise_ref, "expression", Rval::scalar("a|b"), false);

        let mut ctx = ctx_with(&["b"]);
        evaluate_classes_promise(&mut ctx, policy.promise(promise_ref), "agent", None, 0);
        assert!(ctx.class_defined("wanted"));

        let mut ctx = EvalContext::new();
        evaluate_classes_promise(&mut ctx, policy.promise(promise_ref), "agent", None, 0);
        assert!(!ctx.class_defined("wanted"));
    }

    #[test]
    fn conflicting_context_constraints_fail() {
        let mut policy = Policy::new();
        let promise_ref = classes_promise(&mut policy, "confused");
        policy.append_promise_constraint(promise_ref, "expression", Rval::scalar("a"), false);
        policy.append_promise_constraint(promise_ref, "not", Rval::scalar("a"), false);

        let mut ctx = EvalContext::new();
        let outcome =
            evaluate_classes_promise(&mut ctx, policy.promise(promise_ref), "agent", None, 0);
        assert_eq!(outcome, Outcome::Fail);
    }

    #[test]
    fn xor_combination() {
        let mut policy = Policy::new();
        let promise_ref = classes_promise(&mut policy, "odd");
        policy.append_promise_constraint(
            promise_ref,
            "xor",
            Rval::list_of(["a", "b", "c"]),
            false,
        );

        let mut ctx = ctx_with(&["a", "b", "c"]);
        evaluate_classes_promise(&mut ctx, policy.promise(promise_ref), "agent", None, 0);
        assert!(ctx.class_defined("odd"));
    }

    #[test]
    fn persistent_classes_expire_and_reload() {
        let store = PersistentClassStore::new(Box::new(MemStore::new()));
        store.save("burst", 10, StatePolicy::Reset, 1000).unwrap();
        store.save("old", 1, StatePolicy::Reset, 0).unwrap();

        let mut ctx = EvalContext::new();
        store.load(&mut ctx, 1100).unwrap();
        assert!(ctx.class_defined("burst"));
        assert!(!ctx.class_defined("old"));

        // Expired entry was purged from the backing store.
        let mut ctx2 = EvalContext::new();
        store.load(&mut ctx2, 0).unwrap();
        assert!(!ctx2.class_defined("old"));
    }

    #[test]
    fn preserve_policy_keeps_original_expiry() {
        let store = PersistentClassStore::new(Box::new(MemStore::new()));
        store.save("c", 10, StatePolicy::Reset, 1000).unwrap();
        // Preserve must not extend the deadline.
        store.save("c", 1000, StatePolicy::Preserve, 1100).unwrap();

        let mut ctx = EvalContext::new();
        store.load(&mut ctx, 1000 + 11 * 60).unwrap();
        assert!(!ctx.class_defined("c"));
    }
}
