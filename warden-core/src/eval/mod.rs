//! The evaluation context: everything mutable during one agent run. Class
//! heaps, variable tables, the frame stack, regex match state and abort
//! flags live here and are threaded through every actuator; there are no
//! process globals.

pub mod classes;
pub mod expand;
pub mod resolve;
pub mod vars;

use std::collections::{HashMap, HashSet};

use serde_json::Value as Json;
use thiserror::Error;
use tracing::debug;

use crate::policy::DEFAULT_NAMESPACE;

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("invalid class expression '{expression}': {reason}")]
    BadClassExpression { expression: String, reason: String },

    #[error("variable reference nested too deeply in '{0}'")]
    ExpansionTooDeep(String),

    #[error("frame stack underflow")]
    FrameUnderflow,

    #[error("persistent class store: {0}")]
    Persistent(#[from] crate::store::StoreError),
}

pub type EvalResult<T> = std::result::Result<T, EvalError>;

/// A variable's value. Integers and reals are carried as scalars, the way
/// the policy language treats them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(String),
    List(Vec<String>),
    Container(Json),
}

impl Value {
    pub fn scalar<S: Into<String>>(s: S) -> Self {
        Value::Scalar(s.into())
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Where a class lands when added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassScope {
    Global,
    Bundle,
}

/// Key of a variable: namespace, scope (a special scope or a bundle name),
/// bare name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarKey {
    pub ns: String,
    pub scope: String,
    pub name: String,
}

impl VarKey {
    pub fn new(ns: &str, scope: &str, name: &str) -> Self {
        Self {
            ns: ns.to_string(),
            scope: scope.to_string(),
            name: name.to_string(),
        }
    }
}

/// One entry on the evaluation stack.
#[derive(Debug, Clone)]
pub enum Frame {
    Bundle {
        ns: String,
        name: String,
        /// The caller's bundle heap, restored when this frame pops.
        saved_classes: HashSet<String>,
    },
    Section {
        promise_type: String,
    },
    Promise {
        promiser: String,
    },
    PrivateClasses {
        classes: Vec<String>,
    },
}

/// Mutable state of one agent run.
pub struct EvalContext {
    global_classes: HashSet<String>,
    negated_classes: HashSet<String>,
    bundle_classes: HashSet<String>,
    frames: Vec<Frame>,
    pub(crate) variables: HashMap<VarKey, Value>,
    match_captures: Vec<String>,
    abort_bundle: bool,
    abort_run: bool,
    /// Classes whose definition aborts the enclosing bundle.
    abort_bundle_classes: HashSet<String>,
    /// Classes whose definition aborts the whole run.
    abort_run_classes: HashSet<String>,
}

impl Default for EvalContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalContext {
    pub fn new() -> Self {
        let mut ctx = Self {
            global_classes: HashSet::new(),
            negated_classes: HashSet::new(),
            bundle_classes: HashSet::new(),
            frames: Vec::new(),
            variables: HashMap::new(),
            match_captures: Vec::new(),
            abort_bundle: false,
            abort_run: false,
            abort_bundle_classes: HashSet::new(),
            abort_run_classes: HashSet::new(),
        };
        ctx.global_classes.insert("any".to_string());
        ctx
    }

    // ---- frames ---------------------------------------------------------

    /// Enter a bundle with a fresh bundle-class heap.
    pub fn push_bundle_frame(&mut self, ns: &str, name: &str) {
        self.push_bundle(ns, name, false);
    }

    /// Enter a sub-bundle that sees the caller's bundle classes, the way
    /// edit bundles do. Classes it adds disappear when the frame pops.
    pub fn push_bundle_frame_inherited(&mut self, ns: &str, name: &str) {
        self.push_bundle(ns, name, true);
    }

    fn push_bundle(&mut self, ns: &str, name: &str, inherit: bool) {
        let saved_classes = if inherit {
            self.bundle_classes.clone()
        } else {
            std::mem::take(&mut self.bundle_classes)
        };
        self.frames.push(Frame::Bundle {
            ns: ns.to_string(),
            name: name.to_string(),
            saved_classes,
        });
        self.abort_bundle = false;
    }

    pub fn push_section_frame(&mut self, promise_type: &str) {
        self.frames.push(Frame::Section {
            promise_type: promise_type.to_string(),
        });
    }

    pub fn push_promise_frame(&mut self, promiser: &str) {
        self.frames.push(Frame::Promise {
            promiser: promiser.to_string(),
        });
        let ns = self.current_namespace().to_string();
        self.variables.insert(
            VarKey::new(&ns, "this", "promiser"),
            Value::scalar(promiser),
        );
    }

    pub fn push_private_class_frame(&mut self) {
        self.frames.push(Frame::PrivateClasses { classes: Vec::new() });
    }

    /// LIFO pop; releases variables and private classes declared within.
    pub fn pop_frame(&mut self) -> EvalResult<()> {
        match self.frames.pop() {
            None => Err(EvalError::FrameUnderflow),
            Some(Frame::Bundle {
                ns,
                name,
                saved_classes,
            }) => {
                self.variables
                    .retain(|key, _| !(key.ns == ns && key.scope == name));
                self.bundle_classes = saved_classes;
                Ok(())
            }
            Some(Frame::Promise { .. }) => {
                self.variables.retain(|key, _| key.scope != "this");
                Ok(())
            }
            Some(Frame::Section { .. }) | Some(Frame::PrivateClasses { .. }) => Ok(()),
        }
    }

    pub fn current_bundle(&self) -> Option<(&str, &str)> {
        self.frames.iter().rev().find_map(|frame| match frame {
            Frame::Bundle { ns, name, .. } => Some((ns.as_str(), name.as_str())),
            _ => None,
        })
    }

    pub fn current_namespace(&self) -> &str {
        self.current_bundle()
            .map(|(ns, _)| ns)
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn current_promise_type(&self) -> Option<&str> {
        self.frames.iter().rev().find_map(|frame| match frame {
            Frame::Section { promise_type } => Some(promise_type.as_str()),
            _ => None,
        })
    }

    // ---- classes --------------------------------------------------------

    pub fn add_class(&mut self, name: &str, scope: ClassScope) {
        debug!(class = name, ?scope, "defining class");
        match scope {
            ClassScope::Global => {
                self.global_classes.insert(name.to_string());
            }
            ClassScope::Bundle => {
                self.bundle_classes.insert(name.to_string());
            }
        }
        if self.abort_run_classes.contains(name) {
            self.abort_run = true;
        }
        if self.abort_bundle_classes.contains(name) {
            self.abort_bundle = true;
        }
    }

    /// Add a class into the innermost private frame; it disappears when the
    /// frame pops.
    pub fn add_private_class(&mut self, name: &str) {
        for frame in self.frames.iter_mut().rev() {
            if let Frame::PrivateClasses { classes } = frame {
                classes.push(name.to_string());
                return;
            }
        }
        // No private frame active: fall back to the bundle heap.
        self.bundle_classes.insert(name.to_string());
    }

    pub fn negate_class(&mut self, name: &str) {
        self.negated_classes.insert(name.to_string());
    }

    /// Membership test against global heap ∪ bundle heap ∪ private stack,
    /// with negations overriding.
    pub fn class_defined(&self, name: &str) -> bool {
        if self.negated_classes.contains(name) {
            return false;
        }
        if self.global_classes.contains(name) || self.bundle_classes.contains(name) {
            return true;
        }
        self.frames.iter().any(|frame| match frame {
            Frame::PrivateClasses { classes } => classes.iter().any(|c| c == name),
            _ => false,
        })
    }

    pub fn global_class_names(&self) -> impl Iterator<Item = &str> {
        self.global_classes.iter().map(String::as_str)
    }

    // ---- aborts ---------------------------------------------------------

    pub fn watch_abort_bundle_class(&mut self, name: &str) {
        self.abort_bundle_classes.insert(name.to_string());
    }

    pub fn watch_abort_run_class(&mut self, name: &str) {
        self.abort_run_classes.insert(name.to_string());
    }

    pub fn bundle_aborted(&self) -> bool {
        self.abort_bundle || self.abort_run
    }

    pub fn run_aborted(&self) -> bool {
        self.abort_run
    }

    // ---- match state ----------------------------------------------------

    /// Record the capture groups of the last successful match; group 0 is
    /// the whole match.
    pub fn set_match_captures(&mut self, captures: Vec<String>) {
        self.match_captures = captures;
    }

    pub fn clear_match_captures(&mut self) {
        self.match_captures.clear();
    }

    pub fn match_capture(&self, index: usize) -> Option<&str> {
        self.match_captures.get(index).map(String::as_str)
    }
}
