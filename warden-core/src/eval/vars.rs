//! Variable scopes and scalar expansion. Variables are keyed by
//! (namespace, scope, name); scopes are the specials `sys`, `const`, `edit`,
//! `this`, `match` plus one scope per bundle. Lookups resolve an explicit
//! qualifier first, then the current promise scope, then the current bundle.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::{EvalContext, Value, VarKey};
use crate::outcome::Outcome;
use crate::policy::{DEFAULT_NAMESPACE, Promise, Rval, split_qualified};

/// Iteration bindings shadow every scope during promise expansion.
pub type Bindings = HashMap<String, String>;

const MAX_EXPANSION_DEPTH: usize = 10;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$[({]([a-zA-Z0-9_][a-zA-Z0-9_.:@]*)[)}]").unwrap()
    })
}

/// True when the string still carries `$(x)` / `${x}` references.
pub fn has_unexpanded(text: &str) -> bool {
    text.contains("$(") || text.contains("${")
}

impl EvalContext {
    pub fn set_variable(&mut self, ns: &str, scope: &str, name: &str, value: Value) {
        self.variables
            .insert(VarKey::new(ns, scope, name), value);
    }

    /// Define a variable in a special scope (`sys`, `const`, `edit`, …) of
    /// the default namespace.
    pub fn set_special(&mut self, scope: &str, name: &str, value: Value) {
        self.set_variable(DEFAULT_NAMESPACE, scope, name, value);
    }

    pub fn get_variable(&self, ns: &str, scope: &str, name: &str) -> Option<&Value> {
        self.variables.get(&VarKey::new(ns, scope, name))
    }

    /// Resolve a reference as written in policy text: `name`, `scope.name`
    /// or `ns:scope.name`.
    pub fn resolve_reference(&self, reference: &str) -> Option<Value> {
        let (ns, rest) = split_qualified(reference);

        if let Some((scope, name)) = rest.split_once('.') {
            if scope == "match" {
                return name
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| self.match_capture(i))
                    .map(Value::scalar);
            }
            let ns = ns.unwrap_or_else(|| self.lookup_namespace_for(scope));
            return self.get_variable(ns, scope, name).cloned();
        }

        // Bare name: promise scope first, then the current bundle.
        let current_ns = self.current_namespace().to_string();
        if let Some(value) = self.get_variable(&current_ns, "this", rest) {
            return Some(value.clone());
        }
        if let Some((bundle_ns, bundle_name)) = self.current_bundle() {
            let bundle_ns = bundle_ns.to_string();
            let bundle_name = bundle_name.to_string();
            if let Some(value) = self.get_variable(&bundle_ns, &bundle_name, rest) {
                return Some(value.clone());
            }
        }
        None
    }

    /// Special scopes always live in the default namespace; bundle scopes
    /// default to the namespace of the running bundle.
    fn lookup_namespace_for(&self, scope: &str) -> &str {
        match scope {
            "sys" | "const" | "edit" | "this" | "match" => DEFAULT_NAMESPACE,
            _ => self.current_namespace(),
        }
    }

    /// Expand `$(x)` and `${x}` references, innermost first, repeatedly up
    /// to a fixed depth. Unresolvable references are left in place.
    pub fn expand_scalar(&self, input: &str, bindings: &Bindings) -> String {
        let pattern = reference_pattern();
        let mut current = input.to_string();

        for _ in 0..MAX_EXPANSION_DEPTH {
            let mut changed = false;
            let mut output = String::with_capacity(current.len());
            let mut last_end = 0;

            for captures in pattern.captures_iter(&current) {
                let whole = captures.get(0).unwrap();
                let name = &captures[1];
                output.push_str(&current[last_end..whole.start()]);

                let replacement = bindings
                    .get(name)
                    .cloned()
                    .or_else(|| match self.resolve_reference(name) {
                        Some(Value::Scalar(s)) => Some(s),
                        _ => None,
                    });

                match replacement {
                    Some(text) => {
                        output.push_str(&text);
                        changed = true;
                    }
                    None => output.push_str(whole.as_str()),
                }
                last_end = whole.end();
            }
            output.push_str(&current[last_end..]);

            if !changed {
                return output;
            }
            current = output;
        }
        current
    }

    /// Expand an rval recursively; list elements and function arguments are
    /// expanded as scalars.
    pub fn expand_rval(&self, rval: &Rval, bindings: &Bindings) -> Rval {
        match rval {
            Rval::Scalar(s) => Rval::Scalar(self.expand_scalar(s, bindings)),
            Rval::List(items) => Rval::List(
                items
                    .iter()
                    .map(|item| self.expand_rval(item, bindings))
                    .collect(),
            ),
            Rval::FnCall(call) => Rval::FnCall(crate::policy::FnCall {
                name: call.name.clone(),
                args: call
                    .args
                    .iter()
                    .map(|arg| self.expand_rval(arg, bindings))
                    .collect(),
            }),
            Rval::Container(json) => Rval::Container(json.clone()),
        }
    }
}

/// Actuate one `vars` promise: bind the promiser in the current bundle scope.
pub fn evaluate_vars_promise(ctx: &mut EvalContext, promise: &Promise) -> Outcome {
    let (ns, scope) = match ctx.current_bundle() {
        Some((ns, name)) => (ns.to_string(), name.to_string()),
        None => (DEFAULT_NAMESPACE.to_string(), "def".to_string()),
    };

    for constraint in &promise.constraints {
        let value = match (constraint.lval.as_str(), &constraint.rval) {
            ("string" | "int" | "real", Rval::Scalar(s)) => Value::Scalar(s.clone()),
            ("slist", Rval::Scalar(s)) => Value::List(vec![s.clone()]),
            ("slist", Rval::List(items)) => Value::List(
                items
                    .iter()
                    .filter_map(Rval::as_scalar)
                    .map(str::to_string)
                    .collect(),
            ),
            ("data", Rval::Container(json)) => Value::Container(json.clone()),
            _ => continue,
        };
        debug!(ns = %ns, scope = %scope, name = %promise.promiser, "defining variable");
        ctx.set_variable(&ns, &scope, &promise.promiser, value);
        return Outcome::Noop;
    }
    Outcome::Noop
}
