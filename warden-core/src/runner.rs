//! The agent run: walk the bundle sequence top-down, expand each promise,
//! dispatch to the per-type actuator under its lock, and fold outcomes
//! upward. One run is one logical thread of control; the only concurrency
//! is with other agent processes, mediated by the lock database.

use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::changes::{ChangeDb, HashAlgo, HashStatus, StatRecord, StatStatus};
use crate::config::RunConfig;
use crate::edit::file::EditFile;
use crate::edit::template::make_template_bundle;
use crate::edit::{EditSession, schedule_edit_operations};
use crate::error::{Result, WardenError};
use crate::eval::classes::{PersistentClassStore, evaluate_classes_promise};
use crate::eval::expand::expand_promise;
use crate::eval::resolve::body_attributes;
use crate::eval::vars::evaluate_vars_promise;
use crate::eval::{EvalContext, Value};
use crate::locks::{GLOBAL_PACKAGE_LOCK, LockManager, now_unix};
use crate::outcome::Outcome;
use crate::package::{
    ModuleSettings, PackageModule, PackagePromiseAttrs, PackageSession, evaluate_absent_promise,
    evaluate_present_promise,
};
use crate::policy::validate::check_runnable;
use crate::policy::{Bundle, Policy, Promise, Rval, split_qualified};
use crate::store::SqliteStore;

/// Section evaluation order within agent bundles.
pub const AGENT_SECTION_ORDER: &[&str] = &["vars", "classes", "files", "packages", "reports"];

/// Aggregate result of one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: Outcome,
    pub promises_evaluated: usize,
}

impl RunSummary {
    /// Process exit status: non-zero when any promise failed.
    pub fn exit_code(&self) -> i32 {
        if self.outcome.is_failure() { 1 } else { 0 }
    }
}

pub struct AgentRunner {
    config: RunConfig,
    locks: LockManager,
    persistent_classes: PersistentClassStore,
}

impl AgentRunner {
    pub fn new(config: RunConfig) -> Result<Self> {
        let locks = LockManager::new(Box::new(SqliteStore::open(config.lock_db_path())?));
        let persistent_classes = PersistentClassStore::new(Box::new(SqliteStore::open(
            config.persistent_class_db_path(),
        )?));
        Ok(Self {
            config,
            locks,
            persistent_classes,
        })
    }

    /// The change database is opened per operation and dropped right after;
    /// no handle is held across promises.
    fn open_change_db(&self) -> Result<ChangeDb> {
        Ok(ChangeDb::new(
            Box::new(SqliteStore::open(self.config.change_db_path())?),
            self.config.change_log_path(),
        ))
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Build the evaluation context for a run: host facts, persistent
    /// classes restored with expired entries purged.
    pub fn context(&self) -> Result<EvalContext> {
        let mut ctx = EvalContext::new();
        ctx.set_special(
            "sys",
            "workdir",
            Value::scalar(self.config.work_dir.display().to_string()),
        );
        ctx.set_special(
            "sys",
            "statedir",
            Value::scalar(self.config.state_dir().display().to_string()),
        );
        self.persistent_classes.load(&mut ctx, now_unix())?;
        Ok(ctx)
    }

    /// Validate and evaluate a policy with a fresh context.
    pub async fn run(&self, policy: &Policy) -> Result<RunSummary> {
        let mut ctx = self.context()?;
        self.run_with_context(policy, &mut ctx).await
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub async fn run_with_context(
        &self,
        policy: &Policy,
        ctx: &mut EvalContext,
    ) -> Result<RunSummary> {
        let report = check_runnable(policy);
        if !report.is_clean() {
            return Err(WardenError::Validation(report));
        }

        let mut summary = RunSummary {
            outcome: Outcome::Noop,
            promises_evaluated: 0,
        };

        for name in self.bundle_sequence(policy) {
            let Some(bundle) = policy.find_bundle(None, &name) else {
                if self.ignore_missing_bundles(policy) {
                    warn!(bundle = %name, "bundle in sequence does not exist, ignoring");
                    continue;
                }
                return Err(WardenError::BundleNotFound(name));
            };

            let outcome = self.evaluate_bundle(policy, ctx, bundle, &mut summary).await?;
            summary.outcome = summary.outcome.and(outcome);

            if ctx.run_aborted() {
                warn!("abort class signalled, ending the run");
                break;
            }
        }

        info!(
            outcome = %summary.outcome,
            promises = summary.promises_evaluated,
            "agent run complete"
        );
        Ok(summary)
    }

    fn bundle_sequence(&self, policy: &Policy) -> Vec<String> {
        if let Some(control) = policy.common_control() {
            if let Some(sequence) = control.constraint_as_list("bundlesequence") {
                if !sequence.is_empty() {
                    return sequence;
                }
            }
        }
        policy
            .bundles
            .iter()
            .filter(|b| b.bundle_type == "agent")
            .map(|b| b.name.clone())
            .collect()
    }

    fn ignore_missing_bundles(&self, policy: &Policy) -> bool {
        policy
            .common_control()
            .and_then(|control| control.constraint_as_bool("ignore_missing_bundles"))
            .unwrap_or(false)
    }

    async fn evaluate_bundle(
        &self,
        policy: &Policy,
        ctx: &mut EvalContext,
        bundle: &Bundle,
        summary: &mut RunSummary,
    ) -> Result<Outcome> {
        debug!(bundle = %bundle.qualified_name(), "evaluating bundle");
        ctx.push_bundle_frame(&bundle.ns, &bundle.name);

        let mut outcome = Outcome::Noop;
        'sections: for section_name in AGENT_SECTION_ORDER {
            let Some(section) = bundle.get_section(section_name) else {
                continue;
            };
            ctx.push_section_frame(section_name);

            for promise in &section.promises {
                summary.promises_evaluated += 1;
                let result = self
                    .evaluate_promise(policy, ctx, bundle, section_name, promise)
                    .await?;
                outcome = outcome.and(result);

                if ctx.bundle_aborted() {
                    warn!(bundle = %bundle.name, "bundle aborted at loop boundary");
                    let _ = ctx.pop_frame();
                    break 'sections;
                }
            }
            let _ = ctx.pop_frame();
        }

        // Custom sections dispatch to out-of-process promise modules.
        for section in &bundle.custom_sections {
            ctx.push_section_frame(&section.promise_type);
            for promise in &section.promises {
                summary.promises_evaluated += 1;
                let result = self
                    .evaluate_promise(policy, ctx, bundle, &section.promise_type, promise)
                    .await?;
                outcome = outcome.and(result);
                if ctx.bundle_aborted() {
                    let _ = ctx.pop_frame();
                    let _ = ctx.pop_frame();
                    return Ok(outcome);
                }
            }
            let _ = ctx.pop_frame();
        }

        let _ = ctx.pop_frame();
        Ok(outcome)
    }

    async fn evaluate_promise(
        &self,
        policy: &Policy,
        ctx: &mut EvalContext,
        bundle: &Bundle,
        section_name: &str,
        promise: &Promise,
    ) -> Result<Outcome> {
        // The sync promise types run inside the expansion loop; the async
        // actuators (files, packages, custom) expand eagerly per instance
        // below via the same iterator, collecting instances first.
        let outcome = match section_name {
            "vars" => expand_promise(ctx, &bundle.bundle_type, section_name, promise, |ctx, p| {
                evaluate_vars_promise(ctx, p)
            }),
            "classes" => {
                let bundle_type = bundle.bundle_type.clone();
                let persistent = &self.persistent_classes;
                expand_promise(ctx, &bundle.bundle_type, section_name, promise, |ctx, p| {
                    evaluate_classes_promise(ctx, p, &bundle_type, Some(persistent), now_unix())
                })
            }
            "reports" => expand_promise(ctx, &bundle.bundle_type, section_name, promise, |_ctx, p| {
                info!(report = %p.promiser, "R: {}", p.promiser);
                Outcome::Noop
            }),
            _ => {
                // Collect the concrete instances, then actuate them one by
                // one with the async handlers.
                let mut instances = Vec::new();
                expand_promise(ctx, &bundle.bundle_type, section_name, promise, |_ctx, p| {
                    instances.push(p.clone());
                    Outcome::Noop
                });
                let mut merged = Outcome::Noop;
                for concrete in instances {
                    let result = match section_name {
                        "files" => self.evaluate_files_promise(policy, ctx, &concrete).await?,
                        "packages" => {
                            self.evaluate_packages_promise(policy, ctx, &concrete).await?
                        }
                        custom => {
                            self.evaluate_custom_promise(custom, &concrete).await?
                        }
                    };
                    self.report_outcome(policy, &concrete, result);
                    merged = merged.and(result);
                    if ctx.bundle_aborted() {
                        break;
                    }
                }
                merged
            }
        };
        Ok(outcome)
    }

    /// Log one structured line per actuated promise, per severity.
    fn report_outcome(&self, policy: &Policy, promise: &Promise, outcome: Outcome) {
        let path = policy.promise_path(promise);
        match outcome {
            Outcome::Noop => debug!(promise = %path, "promise kept, no repair needed"),
            Outcome::Skipped => debug!(promise = %path, "promise skipped this run"),
            Outcome::Change => {
                if self.config.dry_run {
                    info!(promise = %path, "dry-run: promise would be repaired");
                } else {
                    info!(promise = %path, "promise repaired");
                }
            }
            Outcome::Warn => warn!(promise = %path, "promise needs repair, warning only"),
            Outcome::Interrupted => {
                error!(promise = %path, "promise is not convergent, not retried this run");
            }
            Outcome::Fail => error!(promise = %path, "promise failed"),
        }
    }

    // ---- files ----------------------------------------------------------

    async fn evaluate_files_promise(
        &self,
        policy: &Policy,
        ctx: &mut EvalContext,
        promise: &Promise,
    ) -> Result<Outcome> {
        let path = promise.promiser.clone();
        let action = body_attributes(policy, ctx, promise, "action");
        let dry_run = self.config.dry_run
            || action.as_ref().and_then(|a| a.scalar("action_policy")) == Some("warn");
        let ifelapsed = action
            .as_ref()
            .and_then(|a| a.integer("ifelapsed"))
            .map(|v| v as u64)
            .unwrap_or(self.config.ifelapsed_minutes);
        let expireafter = action
            .as_ref()
            .and_then(|a| a.integer("expireafter"))
            .map(|v| v as u64)
            .unwrap_or(self.config.expireafter_minutes);

        let now = now_unix();
        let lock_name = format!("files-{path}");
        let guard = match self.locks.acquire(&lock_name, ifelapsed, expireafter, now)? {
            Ok(guard) => guard,
            Err(denied) => {
                debug!(file = %path, ?denied, "files promise lock unavailable");
                return Ok(Outcome::Skipped);
            }
        };

        let mut outcome = Outcome::Noop;

        // Creation first: editing needs something to edit.
        let exists = Path::new(&path).exists();
        if !exists && promise.constraint_as_bool("create") == Some(true) {
            if dry_run {
                info!(file = %path, "dry-run: would create file");
                outcome = outcome.and(Outcome::Change);
            } else {
                if let Some(parent) = Path::new(&path).parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                match std::fs::write(&path, b"") {
                    Ok(()) => {
                        info!(file = %path, "created file");
                        outcome = outcome.and(Outcome::Change);
                    }
                    Err(e) => {
                        error!(file = %path, "could not create file: {e}");
                        self.locks.yield_lock(guard, now_unix())?;
                        return Ok(Outcome::Fail);
                    }
                }
            }
        }

        if promise.get_constraint("edit_line").is_some()
            || promise.get_constraint("edit_template").is_some()
        {
            // In dry-run a promised creation counts as having happened, so
            // the edit is still evaluated in memory.
            let editable =
                Path::new(&path).exists() || promise.constraint_as_bool("create") == Some(true);
            if !editable {
                warn!(file = %path, "file to edit does not exist and is not promised created");
                self.locks.yield_lock(guard, now_unix())?;
                return Ok(Outcome::Fail);
            }
            let result = self.edit_file(policy, ctx, promise, &path, ifelapsed, dry_run)?;
            outcome = outcome.and(result);
        }

        if promise.get_constraint("changes").is_some() {
            let result = self.track_changes(policy, ctx, promise, &path)?;
            outcome = outcome.and(result);
        }

        self.locks.yield_lock(guard, now_unix())?;
        Ok(outcome)
    }

    fn edit_file(
        &self,
        policy: &Policy,
        ctx: &mut EvalContext,
        promise: &Promise,
        path: &str,
        ifelapsed: u64,
        dry_run: bool,
    ) -> Result<Outcome> {
        let mut edit_file = EditFile::load(path)?;

        let defaults = body_attributes(policy, ctx, promise, "edit_defaults");
        if let Some(max_size) = defaults.as_ref().and_then(|d| d.integer("max_file_size")) {
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if max_size > 0 && size > max_size as u64 {
                warn!(file = %path, size, max_size, "file is too large to edit");
                return Ok(Outcome::Fail);
            }
        }
        if defaults
            .as_ref()
            .and_then(|d| d.boolean("empty_file_before_editing"))
            == Some(true)
        {
            edit_file.lines.clear();
        }

        let session = EditSession {
            locks: &self.locks,
            persistent_classes: Some(&self.persistent_classes),
            edit_ifelapsed_minutes: self.config.ifelapsed_minutes,
            expireafter_minutes: self.config.expireafter_minutes,
        };

        let mut outcome = if let Some(template_path) =
            promise.constraint_as_scalar("edit_template")
        {
            match std::fs::read_to_string(template_path) {
                Err(e) => {
                    warn!(template = %template_path, "unable to open template file: {e}");
                    Outcome::Interrupted
                }
                Ok(text) => {
                    let mut scratch = Policy::new();
                    match make_template_bundle(&mut scratch, ctx, &text, template_path) {
                        Err(e) => {
                            warn!("{e}");
                            Outcome::Interrupted
                        }
                        Ok(bundle_id) => schedule_edit_operations(
                            &scratch,
                            ctx,
                            &session,
                            bundle_id,
                            &[],
                            &mut edit_file,
                            ifelapsed,
                            now_unix(),
                        )?,
                    }
                }
            }
        } else {
            let Some(constraint) = promise.get_constraint("edit_line") else {
                return Ok(Outcome::Noop);
            };
            let (symbol, args) = match &constraint.rval {
                Rval::Scalar(s) => (s.as_str(), Vec::new()),
                Rval::FnCall(call) => (call.name.as_str(), call.args.clone()),
                _ => {
                    warn!(file = %path, "edit_line attribute is not a bundle reference");
                    return Ok(Outcome::Fail);
                }
            };
            let (ns, bare) = split_qualified(symbol);
            let section = policy.section(promise.parent);
            let bundle_ns = &policy.bundle(section.parent).ns;
            match policy.get_bundle(ns.or(Some(bundle_ns)), "edit_line", bare) {
                None => {
                    warn!(bundle = symbol, "edit_line bundle does not exist");
                    Outcome::Fail
                }
                Some(edit_bundle) => schedule_edit_operations(
                    policy,
                    ctx,
                    &session,
                    edit_bundle.id,
                    &args,
                    &mut edit_file,
                    ifelapsed,
                    now_unix(),
                )?,
            }
        };

        if edit_file.modified() {
            if edit_file.save(dry_run)? {
                outcome = outcome.and(Outcome::Change);
            }
        }
        Ok(outcome)
    }

    fn track_changes(
        &self,
        policy: &Policy,
        ctx: &EvalContext,
        promise: &Promise,
        path: &str,
    ) -> Result<Outcome> {
        let body = body_attributes(policy, ctx, promise, "changes").unwrap_or_default();
        let algo = body
            .scalar("hash")
            .and_then(|word| word.parse::<HashAlgo>().ok())
            .unwrap_or(HashAlgo::Best);
        let update = body.boolean("update_hashes").unwrap_or(false) && !self.config.dry_run;
        let report = body.scalar("report_changes").unwrap_or("all");
        let handle = promise.handle();
        let now = now_unix() as i64;

        let target = Path::new(path);
        if !target.exists() {
            debug!(file = %path, "change tracking target does not exist");
            return Ok(Outcome::Noop);
        }

        let changes = self.open_change_db()?;
        let mut outcome = Outcome::Noop;

        if target.is_dir() {
            let mut names: Vec<String> = std::fs::read_dir(target)
                .map_err(WardenError::Io)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .collect();
            names.sort();

            let recorded = changes.directory_list(path)?;
            for name in &names {
                if recorded.binary_search(name).is_err() && !recorded.is_empty() {
                    changes
                        .log_new_file(&format!("{path}/{name}"), handle, now)?;
                }
            }
            let (new, removed) =
                changes.check_and_update_directory(path, &names, update, handle, now)?;
            if new > 0 || removed > 0 {
                outcome = outcome.and(Outcome::Change);
            }
            return Ok(outcome);
        }

        if report == "all" || report == "content" {
            let digest = algo.digest_file(target)?;
            match changes
                .check_and_update_hash(path, algo, &digest, update, handle, now)?
            {
                HashStatus::New => outcome = outcome.and(Outcome::Change),
                HashStatus::Unchanged => {}
                HashStatus::Changed => {
                    outcome = outcome.and(if update { Outcome::Change } else { Outcome::Fail });
                }
            }
        }

        if report == "all" || report == "stats" {
            let meta = std::fs::metadata(target).map_err(WardenError::Io)?;
            let stat = StatRecord::from_metadata(&meta);
            match changes
                .check_and_update_stats(path, &stat, update, handle, now)?
            {
                StatStatus::New | StatStatus::Changed => outcome = outcome.and(Outcome::Change),
                StatStatus::Unchanged => {}
            }
        }

        Ok(outcome)
    }

    // ---- packages -------------------------------------------------------

    async fn evaluate_packages_promise(
        &self,
        policy: &Policy,
        ctx: &mut EvalContext,
        promise: &Promise,
    ) -> Result<Outcome> {
        let Some(module_body) = body_attributes(policy, ctx, promise, "package_module") else {
            warn!(package = %promise.promiser, "packages promise has no package_module body");
            return Ok(Outcome::Fail);
        };
        let module_name = promise
            .constraint_as_scalar("package_module")
            .map(|symbol| split_qualified(symbol).1.to_string())
            .unwrap_or_default();

        let settings = ModuleSettings {
            module_path: module_body.scalar("module_path").map(str::to_string),
            interpreter: module_body.scalar("interpreter").map(str::to_string),
            installed_ifelapsed: module_body
                .integer("query_installed_ifelapsed")
                .map(|v| v as u64),
            updates_ifelapsed: module_body
                .integer("query_updates_ifelapsed")
                .map(|v| v as u64),
            default_options: module_body.list("default_options").unwrap_or_default(),
        };

        let mut options = settings.default_options.clone();
        options.extend(promise.constraint_as_list("options").unwrap_or_default());

        let attrs = PackagePromiseAttrs {
            absent: promise.constraint_as_scalar("policy") == Some("absent"),
            version: promise.constraint_as_scalar("version").map(str::to_string),
            architecture: promise
                .constraint_as_scalar("architecture")
                .map(str::to_string),
            options,
        };

        // Every package operation runs under the host-global package lock.
        let now = now_unix();
        let guard = match self.locks.acquire(
            GLOBAL_PACKAGE_LOCK,
            0,
            self.config.expireafter_minutes,
            now,
        )? {
            Ok(guard) => guard,
            Err(denied) => {
                info!(?denied, "can not acquire global package lock, skipping");
                return Ok(Outcome::Skipped);
            }
        };

        let session = PackageSession {
            config: &self.config,
            locks: &self.locks,
            dry_run: self.config.dry_run,
        };

        let result = async {
            let module = PackageModule::connect(&module_name, settings, &self.config).await?;
            if attrs.absent {
                evaluate_absent_promise(&session, &module, &promise.promiser, &attrs).await
            } else {
                evaluate_present_promise(&session, &module, &promise.promiser, &attrs).await
            }
        }
        .await;

        self.locks.yield_lock(guard, now_unix())?;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(package = %promise.promiser, "package promise failed: {e}");
                Ok(Outcome::Fail)
            }
        }
    }

    // ---- custom promise types -------------------------------------------

    /// Catch-all: a custom promise type is handed to an out-of-process
    /// module named after the type, speaking the same wire framing as the
    /// package protocol. `Result=kept|repaired|not_kept` decides the
    /// outcome.
    async fn evaluate_custom_promise(
        &self,
        promise_type: &str,
        promise: &Promise,
    ) -> Result<Outcome> {
        use crate::package::wire::{ModuleExec, Request, Verb, communicate};

        let module_path = self
            .config
            .work_dir
            .join("modules")
            .join("promises")
            .join(promise_type);
        if !module_path.is_file() {
            warn!(
                promise_type,
                path = %module_path.display(),
                "no module for custom promise type"
            );
            return Ok(Outcome::Fail);
        }

        let mut request = Request::new().attribute("Promiser", &promise.promiser);
        for constraint in &promise.constraints {
            if let Rval::Scalar(value) = &constraint.rval {
                request = request.attribute(&constraint.lval, value);
            }
        }

        let exec = ModuleExec::direct(module_path.display().to_string());
        let reply = communicate(
            &exec,
            Verb::EvaluatePromise,
            &request.attribute("PromiseType", promise_type),
            self.config.module_timeout,
            self.config.module_poll,
        )
        .await;

        match reply {
            Err(e) => {
                warn!(promise_type, "custom promise module failed: {e}");
                Ok(Outcome::Fail)
            }
            Ok(lines) => {
                for line in &lines {
                    match line.strip_prefix("Result=") {
                        Some("kept") => return Ok(Outcome::Noop),
                        Some("repaired") => return Ok(Outcome::Change),
                        Some("not_kept") => return Ok(Outcome::Fail),
                        _ => {}
                    }
                }
                Ok(Outcome::Noop)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DEFAULT_NAMESPACE;

    fn runner(dir: &tempfile::TempDir) -> AgentRunner {
        AgentRunner::new(RunConfig::default().with_work_dir(dir.path())).unwrap()
    }

    fn runnable_policy() -> Policy {
        let mut policy = Policy::new();
        policy.append_body(DEFAULT_NAMESPACE, "control", "common", vec![], None, false);
        policy
    }

    #[tokio::test]
    async fn invalid_policy_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = runnable_policy();
        policy.append_bundle(DEFAULT_NAMESPACE, "this", "agent", vec![], None);

        let result = runner(&dir).run(&policy).await;
        assert!(matches!(result, Err(WardenError::Validation(_))));
    }

    #[tokio::test]
    async fn missing_bundle_in_sequence_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = runnable_policy();
        let control = policy.common_control().unwrap().id;
        policy.append_body_constraint(
            control,
            "bundlesequence",
            Rval::list_of(["ghost"]),
            "any",
            false,
        );

        let result = runner(&dir).run(&policy).await;
        assert!(matches!(result, Err(WardenError::BundleNotFound(_))));
    }

    #[tokio::test]
    async fn ignore_missing_bundles_downgrades_to_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = runnable_policy();
        let control = policy.common_control().unwrap().id;
        policy.append_body_constraint(
            control,
            "bundlesequence",
            Rval::list_of(["ghost"]),
            "any",
            false,
        );
        policy.append_body_constraint(
            control,
            "ignore_missing_bundles",
            Rval::scalar("true"),
            "any",
            false,
        );

        let summary = runner(&dir).run(&policy).await.unwrap();
        assert_eq!(summary.outcome, Outcome::Noop);
    }

    #[tokio::test]
    async fn class_guards_gate_promises() {
        // A classes promise fires the guarded reports in the same bundle.
        let dir = tempfile::tempdir().unwrap();
        let mut policy = runnable_policy();
        let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "main", "agent", vec![], None);
        let classes = policy.append_section(bundle, "classes");
        policy.append_promise(classes, "role_2", None, "any");

        let reports = policy.append_section(bundle, "reports");
        policy.append_promise(reports, "one", None, "role_1");
        policy.append_promise(reports, "two", None, "role_2");
        policy.append_promise(reports, "three", None, "role_1|role_2");

        let summary = runner(&dir).run(&policy).await.unwrap();
        // Three promises in reports plus the classes promise were walked.
        assert_eq!(summary.promises_evaluated, 4);
        assert_eq!(summary.outcome, Outcome::Noop);
    }

    #[tokio::test]
    async fn files_promise_creates_and_edits() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("managed.conf");

        let mut policy = runnable_policy();
        let edit = policy.append_bundle(DEFAULT_NAMESPACE, "fix", "edit_line", vec![], None);
        let insert = policy.append_section(edit, "insert_lines");
        policy.append_promise(insert, "setting=on", None, "any");

        let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "main", "agent", vec![], None);
        let files = policy.append_section(bundle, "files");
        let promise = policy.append_promise(files, target.to_str().unwrap(), None, "any");
        policy.append_promise_constraint(promise, "create", Rval::scalar("true"), false);
        policy.append_promise_constraint(promise, "edit_line", Rval::scalar("fix"), true);

        let agent = runner(&dir);
        let summary = agent.run(&policy).await.unwrap();
        assert_eq!(summary.outcome, Outcome::Change);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "setting=on\n");
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("managed.conf");

        let mut policy = runnable_policy();
        let edit = policy.append_bundle(DEFAULT_NAMESPACE, "fix", "edit_line", vec![], None);
        let insert = policy.append_section(edit, "insert_lines");
        policy.append_promise(insert, "setting=on", None, "any");

        let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "main", "agent", vec![], None);
        let files = policy.append_section(bundle, "files");
        let promise = policy.append_promise(files, target.to_str().unwrap(), None, "any");
        policy.append_promise_constraint(promise, "create", Rval::scalar("true"), false);
        policy.append_promise_constraint(promise, "edit_line", Rval::scalar("fix"), true);

        let mut config = RunConfig::default().with_work_dir(dir.path());
        config.dry_run = true;
        let agent = AgentRunner::new(config).unwrap();

        let summary = agent.run(&policy).await.unwrap();
        // The would-be repair is accounted as a change...
        assert_eq!(summary.outcome, Outcome::Change);
        // ...but the filesystem was left alone.
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn change_tracking_detects_content_drift() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("watched");
        std::fs::write(&target, "v1").unwrap();

        let mut policy = runnable_policy();
        let body = policy.append_body(DEFAULT_NAMESPACE, "detect", "changes", vec![], None, false);
        policy.append_body_constraint(body, "hash", Rval::scalar("sha256"), "any", false);
        policy.append_body_constraint(body, "update_hashes", Rval::scalar("true"), "any", false);
        policy.append_body_constraint(body, "report_changes", Rval::scalar("content"), "any", false);

        let bundle = policy.append_bundle(DEFAULT_NAMESPACE, "main", "agent", vec![], None);
        let files = policy.append_section(bundle, "files");
        let promise = policy.append_promise(files, target.to_str().unwrap(), None, "any");
        policy.append_promise_constraint(promise, "changes", Rval::scalar("detect"), true);

        let agent = runner(&dir);
        // First run stores the baseline.
        let summary = agent.run(&policy).await.unwrap();
        assert_eq!(summary.outcome, Outcome::Change);

        // Unchanged content: converged. The files lock throttles within
        // ifelapsed, so bypass it with a fresh runner config.
        std::fs::write(&target, "v2").unwrap();
        let mut config = RunConfig::default().with_work_dir(dir.path());
        config.ifelapsed_minutes = 0;
        let agent = AgentRunner::new(config).unwrap();
        let summary = agent.run(&policy).await.unwrap();
        assert_eq!(summary.outcome, Outcome::Change);

        let log = std::fs::read_to_string(agent.config().change_log_path()).unwrap();
        assert!(log.contains(",C,"));
    }
}
