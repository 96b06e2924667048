//! The in-memory policy model: an agent run evaluates one [`Policy`], a typed
//! tree of bundles, sections, promises and constraints, plus reusable
//! attribute [`Body`] blocks referenced from promises by name.
//!
//! Cross-references (promise → section → bundle → policy, constraint →
//! parent) are expressed as indices into the owning policy's collections, not
//! owning pointers. Builders keep them consistent; [`Policy::merge`] rebuilds
//! them after transferring ownership.

pub mod json;
pub mod syntax;
pub mod validate;

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as Json;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace separator in qualified names such as `ns:bundle`.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Position of an element in its source file, 1-based. Zero means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceOffset {
    pub line: usize,
    pub column: usize,
}

impl SourceOffset {
    pub fn at(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// A function call appearing as a right-value, resolved during expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct FnCall {
    pub name: String,
    pub args: Vec<Rval>,
}

impl fmt::Display for FnCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

/// Right-value of a constraint or promisee.
#[derive(Debug, Clone, PartialEq)]
pub enum Rval {
    Scalar(String),
    List(Vec<Rval>),
    FnCall(FnCall),
    Container(Json),
}

impl Rval {
    pub fn scalar<S: Into<String>>(s: S) -> Self {
        Rval::Scalar(s.into())
    }

    pub fn list_of<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Rval::List(items.into_iter().map(Rval::scalar).collect())
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Rval::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Rval]> {
        match self {
            Rval::List(items) => Some(items),
            _ => None,
        }
    }

    /// The symbol a scalar or function-call rval refers to, used when
    /// resolving body references.
    pub fn full_symbol(&self) -> Option<&str> {
        match self {
            Rval::Scalar(s) => Some(s),
            Rval::FnCall(call) => Some(&call.name),
            _ => None,
        }
    }
}

impl fmt::Display for Rval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rval::Scalar(s) => write!(f, "{s}"),
            Rval::List(items) => {
                write!(f, "{{ ")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{item}\"")?;
                }
                write!(f, " }}")
            }
            Rval::FnCall(call) => write!(f, "{call}"),
            Rval::Container(json) => write!(f, "{json}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyId(pub usize);

/// Which of a bundle's two section collections a section lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionSlot {
    Builtin,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionRef {
    pub bundle: BundleId,
    pub slot: SectionSlot,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromiseRef {
    pub section: SectionRef,
    pub index: usize,
}

/// A constraint hangs off either a promise or a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintParent {
    Promise(PromiseRef),
    Body(BodyId),
}

/// One `lval => rval` attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub lval: String,
    pub rval: Rval,
    /// Class guard; always `"any"` for promise constraints.
    pub classes: String,
    /// True for `thing => bodyname` as opposed to `thing => "literal"`.
    pub references_body: bool,
    pub offset: SourceOffset,
    pub parent: ConstraintParent,
}

/// A convergent declaration about one subject (the promiser).
#[derive(Debug, Clone, PartialEq)]
pub struct Promise {
    pub promiser: String,
    pub promisee: Option<Rval>,
    /// Class guard expression; defaults to `"any"`.
    pub classes: String,
    pub comment: Option<String>,
    pub offset: SourceOffset,
    pub constraints: Vec<Constraint>,
    pub parent: SectionRef,
    /// The pre-expansion promise this instance was derived from. For
    /// promises built directly into the policy this points at itself.
    pub org: Option<PromiseRef>,
}

impl Promise {
    pub fn get_constraint(&self, lval: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.lval == lval)
    }

    pub fn constraint_as_scalar(&self, lval: &str) -> Option<&str> {
        self.get_constraint(lval).and_then(|c| c.rval.as_scalar())
    }

    pub fn constraint_as_bool(&self, lval: &str) -> Option<bool> {
        self.constraint_as_scalar(lval).and_then(parse_bool)
    }

    pub fn constraint_as_int(&self, lval: &str) -> Option<i64> {
        self.constraint_as_scalar(lval)
            .and_then(|s| s.parse::<i64>().ok())
    }

    /// Scalars of a list-valued constraint; a lone scalar is a 1-list.
    pub fn constraint_as_list(&self, lval: &str) -> Option<Vec<String>> {
        match &self.get_constraint(lval)?.rval {
            Rval::Scalar(s) => Some(vec![s.clone()]),
            Rval::List(items) => Some(
                items
                    .iter()
                    .filter_map(|r| r.as_scalar().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<&str> {
        self.constraint_as_scalar("handle")
    }
}

/// A section groups the promises of one type within a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleSection {
    pub promise_type: String,
    pub offset: SourceOffset,
    pub promises: Vec<Promise>,
    pub parent: BundleId,
}

/// A named, typed unit of policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub ns: String,
    pub bundle_type: String,
    pub name: String,
    pub args: Vec<String>,
    pub source_path: Option<String>,
    pub offset: SourceOffset,
    pub sections: Vec<BundleSection>,
    pub custom_sections: Vec<BundleSection>,
    pub id: BundleId,
}

impl Bundle {
    pub fn qualified_name(&self) -> String {
        format!("{}{}{}", self.ns, NAMESPACE_SEPARATOR, self.name)
    }

    pub fn get_section(&self, promise_type: &str) -> Option<&BundleSection> {
        self.sections
            .iter()
            .chain(self.custom_sections.iter())
            .find(|s| s.promise_type == promise_type)
    }

    fn section_ref(&self, promise_type: &str) -> Option<SectionRef> {
        if let Some(index) = self
            .sections
            .iter()
            .position(|s| s.promise_type == promise_type)
        {
            return Some(SectionRef {
                bundle: self.id,
                slot: SectionSlot::Builtin,
                index,
            });
        }
        self.custom_sections
            .iter()
            .position(|s| s.promise_type == promise_type)
            .map(|index| SectionRef {
                bundle: self.id,
                slot: SectionSlot::Custom,
                index,
            })
    }
}

/// A named, reusable set of constraints referenced from promise attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub ns: String,
    pub body_type: String,
    pub name: String,
    pub args: Vec<String>,
    pub source_path: Option<String>,
    pub offset: SourceOffset,
    pub constraints: Vec<Constraint>,
    pub is_custom: bool,
    pub id: BodyId,
}

impl Body {
    pub fn get_constraints(&self, lval: &str) -> Vec<&Constraint> {
        self.constraints.iter().filter(|c| c.lval == lval).collect()
    }

    pub fn constraint_as_scalar(&self, lval: &str) -> Option<&str> {
        self.constraints
            .iter()
            .find(|c| c.lval == lval)
            .and_then(|c| c.rval.as_scalar())
    }

    pub fn constraint_as_bool(&self, lval: &str) -> Option<bool> {
        self.constraint_as_scalar(lval).and_then(parse_bool)
    }

    pub fn constraint_as_int(&self, lval: &str) -> Option<i64> {
        self.constraint_as_scalar(lval)
            .and_then(|s| s.parse::<i64>().ok())
    }

    pub fn constraint_as_list(&self, lval: &str) -> Option<Vec<String>> {
        match &self.constraints.iter().find(|c| c.lval == lval)?.rval {
            Rval::Scalar(s) => Some(vec![s.clone()]),
            Rval::List(items) => Some(
                items
                    .iter()
                    .filter_map(|r| r.as_scalar().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// The root of the model: everything one agent run evaluates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policy {
    pub bundles: Vec<Bundle>,
    pub bodies: Vec<Body>,
    /// Custom promise-type templates, stored as bodies of type `promise`.
    pub custom_promise_types: Vec<Body>,
    /// Source-file path → content hash, carried for release auditing.
    pub file_hashes: BTreeMap<String, String>,
    pub release_id: Option<String>,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- builders -------------------------------------------------------

    pub fn append_bundle(
        &mut self,
        ns: &str,
        name: &str,
        bundle_type: &str,
        args: Vec<String>,
        source_path: Option<String>,
    ) -> BundleId {
        let id = BundleId(self.bundles.len());
        self.bundles.push(Bundle {
            ns: ns.to_string(),
            bundle_type: bundle_type.to_string(),
            name: name.to_string(),
            args,
            source_path,
            offset: SourceOffset::default(),
            sections: Vec::new(),
            custom_sections: Vec::new(),
            id,
        });
        id
    }

    pub fn append_body(
        &mut self,
        ns: &str,
        name: &str,
        body_type: &str,
        args: Vec<String>,
        source_path: Option<String>,
        is_custom: bool,
    ) -> BodyId {
        let id = BodyId(self.bodies.len());
        self.bodies.push(Body {
            ns: ns.to_string(),
            body_type: body_type.to_string(),
            name: name.to_string(),
            args,
            source_path,
            offset: SourceOffset::default(),
            constraints: Vec::new(),
            is_custom,
            id,
        });
        id
    }

    pub fn append_custom_promise_type(
        &mut self,
        ns: &str,
        name: &str,
        args: Vec<String>,
        source_path: Option<String>,
    ) -> usize {
        let index = self.custom_promise_types.len();
        self.custom_promise_types.push(Body {
            ns: ns.to_string(),
            body_type: "promise".to_string(),
            name: name.to_string(),
            args,
            source_path,
            offset: SourceOffset::default(),
            constraints: Vec::new(),
            is_custom: true,
            id: BodyId(index),
        });
        index
    }

    /// Appending a section that already exists returns the existing one.
    pub fn append_section(&mut self, bundle: BundleId, promise_type: &str) -> SectionRef {
        if let Some(existing) = self.bundles[bundle.0].section_ref(promise_type) {
            return existing;
        }

        let section = BundleSection {
            promise_type: promise_type.to_string(),
            offset: SourceOffset::default(),
            promises: Vec::new(),
            parent: bundle,
        };

        let slot = if syntax::is_builtin_promise_type(promise_type) {
            SectionSlot::Builtin
        } else {
            SectionSlot::Custom
        };
        let bundle_ref = &mut self.bundles[bundle.0];
        let index = match slot {
            SectionSlot::Builtin => {
                bundle_ref.sections.push(section);
                bundle_ref.sections.len() - 1
            }
            SectionSlot::Custom => {
                bundle_ref.custom_sections.push(section);
                bundle_ref.custom_sections.len() - 1
            }
        };
        SectionRef {
            bundle,
            slot,
            index,
        }
    }

    pub fn append_promise(
        &mut self,
        section: SectionRef,
        promiser: &str,
        promisee: Option<Rval>,
        classes: &str,
    ) -> PromiseRef {
        let classes = if classes.is_empty() { "any" } else { classes };
        let index = self.section(section).promises.len();
        let promise_ref = PromiseRef { section, index };
        self.section_mut(section).promises.push(Promise {
            promiser: promiser.to_string(),
            promisee,
            classes: classes.to_string(),
            comment: None,
            offset: SourceOffset::default(),
            constraints: Vec::new(),
            parent: section,
            org: Some(promise_ref),
        });
        promise_ref
    }

    /// Append a constraint to a promise, with replace-or-merge semantics:
    /// a repeated lval replaces the previous occurrence in place, except
    /// `if`/`ifvarclass` whose right-values are merged as a logical AND.
    pub fn append_promise_constraint(
        &mut self,
        promise_ref: PromiseRef,
        lval: &str,
        rval: Rval,
        references_body: bool,
    ) {
        let parent = ConstraintParent::Promise(promise_ref);
        let promise = self.promise_mut(promise_ref);
        let mut constraint = Constraint {
            lval: lval.to_string(),
            rval,
            classes: "any".to_string(),
            references_body,
            offset: SourceOffset::default(),
            parent,
        };

        if let Some(position) = promise.constraints.iter().position(|c| c.lval == lval) {
            if lval == "if" || lval == "ifvarclass" {
                if let Some(previous) = promise.constraints[position].rval.as_scalar() {
                    constraint.rval = merge_guards(previous, constraint.rval);
                }
            }
            promise.constraints[position] = constraint;
        } else {
            promise.constraints.push(constraint);
        }
    }

    /// Body constraints replace only when both lval and class guard match.
    pub fn append_body_constraint(
        &mut self,
        body_id: BodyId,
        lval: &str,
        rval: Rval,
        classes: &str,
        references_body: bool,
    ) {
        let body = &mut self.bodies[body_id.0];
        let constraint = Constraint {
            lval: lval.to_string(),
            rval,
            classes: classes.to_string(),
            references_body,
            offset: SourceOffset::default(),
            parent: ConstraintParent::Body(body_id),
        };

        if let Some(position) = body
            .constraints
            .iter()
            .position(|c| c.lval == lval && c.classes == classes)
        {
            body.constraints[position] = constraint;
        } else {
            body.constraints.push(constraint);
        }
    }

    // ---- accessors ------------------------------------------------------

    pub fn bundle(&self, id: BundleId) -> &Bundle {
        &self.bundles[id.0]
    }

    pub fn bundle_mut(&mut self, id: BundleId) -> &mut Bundle {
        &mut self.bundles[id.0]
    }

    pub fn body(&self, id: BodyId) -> &Body {
        &self.bodies[id.0]
    }

    pub fn section(&self, section: SectionRef) -> &BundleSection {
        let bundle = &self.bundles[section.bundle.0];
        match section.slot {
            SectionSlot::Builtin => &bundle.sections[section.index],
            SectionSlot::Custom => &bundle.custom_sections[section.index],
        }
    }

    pub fn section_mut(&mut self, section: SectionRef) -> &mut BundleSection {
        let bundle = &mut self.bundles[section.bundle.0];
        match section.slot {
            SectionSlot::Builtin => &mut bundle.sections[section.index],
            SectionSlot::Custom => &mut bundle.custom_sections[section.index],
        }
    }

    pub fn promise(&self, promise_ref: PromiseRef) -> &Promise {
        &self.section(promise_ref.section).promises[promise_ref.index]
    }

    pub fn promise_mut(&mut self, promise_ref: PromiseRef) -> &mut Promise {
        let index = promise_ref.index;
        &mut self.section_mut(promise_ref.section).promises[index]
    }

    /// Find a body by (namespace, type, name). A `None` namespace matches
    /// the default namespace; the name may itself carry a `ns:` qualifier
    /// which then takes precedence.
    pub fn get_body(&self, ns: Option<&str>, body_type: &str, name: &str) -> Option<&Body> {
        let (name_ns, bare) = split_qualified(name);
        let wanted_ns = name_ns.or(ns).unwrap_or(DEFAULT_NAMESPACE);
        self.bodies
            .iter()
            .find(|b| b.body_type == body_type && b.ns == wanted_ns && b.name == bare)
    }

    pub fn get_bundle(&self, ns: Option<&str>, bundle_type: &str, name: &str) -> Option<&Bundle> {
        let (name_ns, bare) = split_qualified(name);
        let wanted_ns = name_ns.or(ns).unwrap_or(DEFAULT_NAMESPACE);
        self.bundles
            .iter()
            .find(|b| b.bundle_type == bundle_type && b.ns == wanted_ns && b.name == bare)
    }

    /// Find a bundle by name regardless of type, for bundlesequence entries.
    pub fn find_bundle(&self, ns: Option<&str>, name: &str) -> Option<&Bundle> {
        let (name_ns, bare) = split_qualified(name);
        let wanted_ns = name_ns.or(ns).unwrap_or(DEFAULT_NAMESPACE);
        self.bundles
            .iter()
            .find(|b| b.ns == wanted_ns && b.name == bare)
    }

    /// A policy is runnable when it carries a `body common control`.
    pub fn is_runnable(&self) -> bool {
        self.get_body(None, "common", "control").is_some()
    }

    pub fn common_control(&self) -> Option<&Body> {
        self.get_body(None, "common", "control")
    }

    /// Every promise in declaration order, with its location.
    pub fn promises(&self) -> impl Iterator<Item = (&Bundle, &BundleSection, &Promise)> {
        self.bundles.iter().flat_map(|bundle| {
            bundle
                .sections
                .iter()
                .chain(bundle.custom_sections.iter())
                .flat_map(move |section| {
                    section
                        .promises
                        .iter()
                        .map(move |promise| (bundle, section, promise))
                })
        })
    }

    /// Path of a promise in the policy, `/ns/bundle/section/'promiser'`.
    pub fn promise_path(&self, promise: &Promise) -> String {
        let section = self.section(promise.parent);
        let bundle = self.bundle(section.parent);
        format!(
            "/{}/{}/{}/'{}'",
            bundle.ns, bundle.name, section.promise_type, promise.promiser
        )
    }

    // ---- merge ----------------------------------------------------------

    /// Combine two partial policies. Children are transferred; all
    /// cross-reference indices are rebuilt on the result.
    pub fn merge(a: Policy, b: Policy) -> Policy {
        let mut merged = Policy::new();
        merged.bundles = a.bundles;
        merged.bundles.extend(b.bundles);
        merged.bodies = a.bodies;
        merged.bodies.extend(b.bodies);
        merged.custom_promise_types = a.custom_promise_types;
        merged.custom_promise_types.extend(b.custom_promise_types);

        merged.file_hashes = a.file_hashes;
        merged.file_hashes.extend(b.file_hashes);
        merged.release_id = a.release_id.or(b.release_id);

        merged.rebuild_refs();
        merged
    }

    /// Recompute every id and parent reference from the collection layout.
    fn rebuild_refs(&mut self) {
        for (bundle_index, bundle) in self.bundles.iter_mut().enumerate() {
            let bundle_id = BundleId(bundle_index);
            bundle.id = bundle_id;
            for (slot, sections) in [
                (SectionSlot::Builtin, &mut bundle.sections),
                (SectionSlot::Custom, &mut bundle.custom_sections),
            ] {
                for (section_index, section) in sections.iter_mut().enumerate() {
                    section.parent = bundle_id;
                    let section_ref = SectionRef {
                        bundle: bundle_id,
                        slot,
                        index: section_index,
                    };
                    for (promise_index, promise) in section.promises.iter_mut().enumerate() {
                        let promise_ref = PromiseRef {
                            section: section_ref,
                            index: promise_index,
                        };
                        promise.parent = section_ref;
                        promise.org = Some(promise_ref);
                        for constraint in &mut promise.constraints {
                            constraint.parent = ConstraintParent::Promise(promise_ref);
                        }
                    }
                }
            }
        }
        for (body_index, body) in self.bodies.iter_mut().enumerate() {
            let body_id = BodyId(body_index);
            body.id = body_id;
            for constraint in &mut body.constraints {
                constraint.parent = ConstraintParent::Body(body_id);
            }
        }
    }
}

/// AND-merge of two `if`/`ifvarclass` right-values.
fn merge_guards(previous: &str, new: Rval) -> Rval {
    match new {
        Rval::Scalar(s) => Rval::Scalar(format!("({previous}).({s})")),
        Rval::FnCall(call) => Rval::FnCall(FnCall {
            name: "and".to_string(),
            args: vec![Rval::scalar(previous), Rval::FnCall(call)],
        }),
        other => other,
    }
}

/// Split `ns:name` into its parts; the namespace is `None` when unqualified.
pub fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.split_once(NAMESPACE_SEPARATOR) {
        Some((ns, rest)) if !ns.is_empty() => (Some(ns), rest),
        _ => (None, name),
    }
}

/// The boolean word set accepted in scalar attributes.
pub fn parse_bool(word: &str) -> Option<bool> {
    match word {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with_promise() -> (Policy, PromiseRef) {
        let mut policy = Policy::new();
        let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "main", "agent", vec![], None);
        let section = policy.append_section(bundle, "files");
        let promise = policy.append_promise(section, "/etc/motd", None, "any");
        (policy, promise)
    }

    #[test]
    fn section_append_is_idempotent() {
        let mut policy = Policy::new();
        let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "main", "agent", vec![], None);
        let first = policy.append_section(bundle, "files");
        let second = policy.append_section(bundle, "files");
        assert_eq!(first, second);
        assert_eq!(policy.bundle(bundle).sections.len(), 1);
    }

    #[test]
    fn unknown_promise_types_land_in_custom_sections() {
        let mut policy = Policy::new();
        let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "main", "agent", vec![], None);
        let section = policy.append_section(bundle, "gizmos");
        assert_eq!(section.slot, SectionSlot::Custom);
        assert_eq!(policy.bundle(bundle).custom_sections.len(), 1);
    }

    #[test]
    fn empty_class_guard_defaults_to_any() {
        let (policy, promise_ref) = {
            let mut policy = Policy::new();
            let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "main", "agent", vec![], None);
            let section = policy.append_section(bundle, "files");
            let promise = policy.append_promise(section, "/etc/motd", None, "");
            (policy, promise)
        };
        assert_eq!(policy.promise(promise_ref).classes, "any");
    }

    #[test]
    fn repeated_constraint_replaces_in_place() {
        let (mut policy, promise_ref) = policy_with_promise();
        policy.append_promise_constraint(promise_ref, "create", Rval::scalar("true"), false);
        policy.append_promise_constraint(promise_ref, "comment", Rval::scalar("x"), false);
        policy.append_promise_constraint(promise_ref, "create", Rval::scalar("false"), false);

        let promise = policy.promise(promise_ref);
        assert_eq!(promise.constraints.len(), 2);
        // Position preserved: create is still first.
        assert_eq!(promise.constraints[0].lval, "create");
        assert_eq!(promise.constraint_as_scalar("create"), Some("false"));
    }

    #[test]
    fn if_guards_merge_as_and() {
        let (mut policy, promise_ref) = policy_with_promise();
        policy.append_promise_constraint(promise_ref, "if", Rval::scalar("linux"), false);
        policy.append_promise_constraint(promise_ref, "if", Rval::scalar("webserver"), false);

        let promise = policy.promise(promise_ref);
        assert_eq!(promise.constraints.len(), 1);
        assert_eq!(
            promise.constraint_as_scalar("if"),
            Some("(linux).(webserver)")
        );
    }

    #[test]
    fn if_guard_merges_scalar_with_fncall() {
        let (mut policy, promise_ref) = policy_with_promise();
        policy.append_promise_constraint(promise_ref, "if", Rval::scalar("linux"), false);
        policy.append_promise_constraint(
            promise_ref,
            "if",
            Rval::FnCall(FnCall {
                name: "fileexists".into(),
                args: vec![Rval::scalar("/etc/fstab")],
            }),
            false,
        );

        let promise = policy.promise(promise_ref);
        match &promise.get_constraint("if").unwrap().rval {
            Rval::FnCall(call) => {
                assert_eq!(call.name, "and");
                assert_eq!(call.args.len(), 2);
                assert_eq!(call.args[0], Rval::scalar("linux"));
            }
            other => panic!("expected fncall, got {other:?}"),
        }
    }

    #[test]
    fn body_constraints_replace_only_on_matching_guard() {
        let mut policy = Policy::new();
        let body = policy.append_body(DEFAULT_NAMESPACE, "tidy", "action", vec![], None, false);
        policy.append_body_constraint(body, "ifelapsed", Rval::scalar("5"), "any", false);
        policy.append_body_constraint(body, "ifelapsed", Rval::scalar("60"), "weekend", false);
        policy.append_body_constraint(body, "ifelapsed", Rval::scalar("10"), "any", false);

        let body = policy.body(body);
        assert_eq!(body.constraints.len(), 2);
        assert_eq!(body.constraints[0].rval, Rval::scalar("10"));
        assert_eq!(body.constraints[1].classes, "weekend");
    }

    #[test]
    fn merge_rebuilds_cross_references() {
        let (a, _) = policy_with_promise();
        let mut b = Policy::new();
        let bundle = b.append_bundle(DEFAULT_NAMESPACE, "extra", "agent", vec![], None);
        let section = b.append_section(bundle, "files");
        let promise = b.append_promise(section, "/etc/hosts", None, "any");
        b.append_promise_constraint(promise, "create", Rval::scalar("true"), false);

        let merged = Policy::merge(a, b);
        assert_eq!(merged.bundles.len(), 2);

        let second = &merged.bundles[1];
        assert_eq!(second.id, BundleId(1));
        let promise = &second.sections[0].promises[0];
        assert_eq!(promise.parent.bundle, BundleId(1));
        match promise.constraints[0].parent {
            ConstraintParent::Promise(p) => assert_eq!(p.section.bundle, BundleId(1)),
            ConstraintParent::Body(_) => panic!("constraint should belong to a promise"),
        }
        assert_eq!(merged.promise_path(promise), "/default/extra/files/'/etc/hosts'");
    }

    #[test]
    fn runnable_means_common_control_exists() {
        let mut policy = Policy::new();
        assert!(!policy.is_runnable());
        policy.append_body(DEFAULT_NAMESPACE, "control", "common", vec![], None, false);
        assert!(policy.is_runnable());
    }

    #[test]
    fn qualified_name_splitting() {
        assert_eq!(split_qualified("ops:daily"), (Some("ops"), "daily"));
        assert_eq!(split_qualified("daily"), (None, "daily"));
        assert_eq!(split_qualified(":x"), (None, ":x"));
    }
}
