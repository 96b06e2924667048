//! Generic package management through out-of-process provider modules.
//! The engine resolves what a promised package is (`get-package-data`),
//! consults per-provider caches of installed packages and updates, and
//! drives `repo-install` / `file-install` / `remove` to converge, always
//! under the host-global package lock.

pub mod cache;
pub mod wire;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::locks::{LockManager, now_unix};
use crate::outcome::Outcome;
use crate::store::{SqliteStore, StoreError};

use self::cache::{UpdateKind, is_package_in_cache, rebuild_cache, versions_from_updates};
use self::wire::{ModuleExec, PackageInfo, PackageType, Request, Verb, communicate};

pub const SUPPORTED_API_VERSION: i64 = 1;

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("could not start package module '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("pipe error with package module '{program}': {source}")]
    Pipe {
        program: String,
        source: std::io::Error,
    },

    #[error("package module '{program}' timed out on '{verb}'")]
    Timeout { program: String, verb: String },

    #[error("package module '{program}' failed on '{verb}' with exit code {code}")]
    ModuleFailed {
        program: String,
        verb: String,
        code: i32,
    },

    #[error("package module '{name}' not found or not executable at '{path}'")]
    MissingModule { name: String, path: String },

    #[error("package module '{name}' speaks unsupported API version {version}")]
    UnsupportedApi { name: String, version: i64 },

    #[error("package cache: {0}")]
    Store(#[from] StoreError),
}

pub type PackageResult<T> = std::result::Result<T, PackageError>;

/// Provider description as configured by a `package_module` body.
#[derive(Debug, Clone, Default)]
pub struct ModuleSettings {
    pub module_path: Option<String>,
    pub interpreter: Option<String>,
    pub installed_ifelapsed: Option<u64>,
    pub updates_ifelapsed: Option<u64>,
    pub default_options: Vec<String>,
}

/// A ready-to-use provider: executable located and API version negotiated.
pub struct PackageModule {
    pub name: String,
    exec: ModuleExec,
    pub settings: ModuleSettings,
    timeout: Duration,
    kill_grace: Duration,
}

impl PackageModule {
    /// Locate the provider executable (defaulting to
    /// `<module-dir>/<name>`), then negotiate `supports-api-version`.
    pub async fn connect(
        name: &str,
        settings: ModuleSettings,
        config: &RunConfig,
    ) -> PackageResult<Self> {
        let module_path = settings
            .module_path
            .clone()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| config.module_dir().join(name));

        if !is_executable(&module_path) && settings.interpreter.is_none() {
            return Err(PackageError::MissingModule {
                name: name.to_string(),
                path: module_path.display().to_string(),
            });
        }

        let exec = match &settings.interpreter {
            None => ModuleExec::direct(module_path.display().to_string()),
            Some(interpreter) => {
                if !module_path.is_file() {
                    return Err(PackageError::MissingModule {
                        name: name.to_string(),
                        path: module_path.display().to_string(),
                    });
                }
                let mut words = interpreter.split_whitespace();
                let program = words.next().unwrap_or(interpreter).to_string();
                if !is_executable(&PathBuf::from(&program)) {
                    return Err(PackageError::MissingModule {
                        name: name.to_string(),
                        path: program,
                    });
                }
                let mut pre_args: Vec<String> = words.map(str::to_string).collect();
                pre_args.push(module_path.display().to_string());
                ModuleExec { program, pre_args }
            }
        };

        let module = Self {
            name: name.to_string(),
            exec,
            settings,
            timeout: config.module_timeout,
            kill_grace: config.module_poll,
        };

        let reply = module
            .exchange(Verb::SupportsApiVersion, Request::new())
            .await?;
        let version = match reply.as_slice() {
            [line] => line.trim().parse::<i64>().unwrap_or(-1),
            _ => -1,
        };
        if version != SUPPORTED_API_VERSION {
            return Err(PackageError::UnsupportedApi {
                name: module.name,
                version,
            });
        }
        debug!(module = %module.name, version, "package module connected");
        Ok(module)
    }

    async fn exchange(&self, verb: Verb, request: Request) -> PackageResult<Vec<String>> {
        communicate(&self.exec, verb, &request, self.timeout, self.kill_grace).await
    }

    /// Ask the provider what kind of package a promiser names.
    pub async fn get_package_data(
        &self,
        name: &str,
        version: Option<&str>,
        arch: Option<&str>,
        options: &[String],
    ) -> PackageResult<Option<PackageInfo>> {
        let request = Request::new()
            .options(options)
            .attribute("File", name)
            .optional("Version", version)
            .optional("Architecture", arch);
        let reply = self.exchange(Verb::GetPackageData, request).await?;
        Ok(wire::parse_package_data(&reply))
    }

    pub async fn list(&self, kind: UpdateKind, options: &[String]) -> PackageResult<Vec<String>> {
        let verb = match kind {
            UpdateKind::Installed => Verb::ListInstalled,
            UpdateKind::Updates => Verb::ListUpdates,
            UpdateKind::LocalUpdates => Verb::ListUpdatesLocal,
        };
        self.exchange(verb, Request::new().options(options)).await
    }

    pub async fn install(
        &self,
        package_type: PackageType,
        body: Request,
    ) -> PackageResult<bool> {
        let verb = match package_type {
            PackageType::File => Verb::FileInstall,
            PackageType::Repo => Verb::RepoInstall,
        };
        let reply = self.exchange(verb, body).await?;
        Ok(!wire::reply_reports_error(&reply))
    }

    pub async fn remove(
        &self,
        name: &str,
        version: Option<&str>,
        arch: Option<&str>,
        options: &[String],
    ) -> PackageResult<bool> {
        let request = Request::new()
            .options(options)
            .attribute("Name", name)
            .optional("Version", version)
            .optional("Architecture", arch);
        let reply = self.exchange(Verb::Remove, request).await?;
        Ok(!wire::reply_reports_error(&reply))
    }
}

fn is_executable(path: &std::path::Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// What a `packages` promise asks for.
#[derive(Debug, Clone, Default)]
pub struct PackagePromiseAttrs {
    pub absent: bool,
    pub version: Option<String>,
    pub architecture: Option<String>,
    pub options: Vec<String>,
}

/// Everything the actuators need from the host.
pub struct PackageSession<'a> {
    pub config: &'a RunConfig,
    pub locks: &'a LockManager,
    pub dry_run: bool,
}

impl PackageSession<'_> {
    fn open_cache(&self, module: &PackageModule, kind: UpdateKind) -> PackageResult<SqliteStore> {
        Ok(SqliteStore::open(
            self.config
                .package_cache_path(&module.name, kind.cache_family()),
        )?)
    }

    /// Refresh one cache through the provider, honouring the ifelapsed
    /// throttle unless forced. A missing database forces a refresh and
    /// promotes a local-updates query to the networked one.
    pub async fn refresh_cache(
        &self,
        module: &PackageModule,
        mut kind: UpdateKind,
        force: bool,
    ) -> PackageResult<bool> {
        let db_path = self
            .config
            .package_cache_path(&module.name, kind.cache_family());
        let mut force = force;
        if !db_path.exists() {
            debug!(module = %module.name, "forcing package list update due to missing database");
            force = true;
            if kind == UpdateKind::LocalUpdates {
                kind = UpdateKind::Updates;
            }
        }

        let (lock_name, ifelapsed) = match kind {
            UpdateKind::Installed => (
                format!("package-cache-installed-{}", module.name),
                module.settings.installed_ifelapsed.unwrap_or(30),
            ),
            _ => (
                format!("package-cache-updates-{}", module.name),
                module.settings.updates_ifelapsed.unwrap_or(30),
            ),
        };

        let now = now_unix();
        let guard = if force {
            None
        } else {
            match self.locks.acquire(
                &lock_name,
                ifelapsed,
                self.config.expireafter_minutes,
                now,
            ) {
                Ok(Ok(guard)) => Some(guard),
                Ok(Err(_)) => {
                    debug!(module = %module.name, ?kind, "skipping package cache update");
                    return Ok(true);
                }
                Err(e) => {
                    warn!("package cache lock failure: {e}");
                    return Ok(false);
                }
            }
        };

        let lines = module.list(kind, &module.settings.default_options).await?;
        let store = self.open_cache(module, kind)?;
        let clean = rebuild_cache(&store, &lines, kind)?;

        if let Some(guard) = guard {
            if let Err(e) = self.locks.yield_lock(guard, now_unix()) {
                warn!("could not yield package cache lock: {e}");
            }
        }
        Ok(clean)
    }

    async fn is_in_cache(
        &self,
        module: &PackageModule,
        name: &str,
        version: Option<&str>,
        arch: Option<&str>,
    ) -> PackageResult<bool> {
        self.refresh_cache(module, UpdateKind::Installed, false).await?;
        let store = self.open_cache(module, UpdateKind::Installed)?;
        is_package_in_cache(&store, name, version, arch)
    }

    /// Refresh both caches after a mutation and confirm the expected state.
    async fn validate_changed_package(
        &self,
        module: &PackageModule,
        name: &str,
        version: Option<&str>,
        arch: Option<&str>,
        expect_present: bool,
    ) -> PackageResult<Outcome> {
        if !self.refresh_cache(module, UpdateKind::Installed, true).await? {
            warn!(package = name, "can not update installed packages cache after change");
            return Ok(Outcome::Fail);
        }
        if !self.refresh_cache(module, UpdateKind::LocalUpdates, true).await? {
            warn!(package = name, "can not update available updates cache after change");
            return Ok(Outcome::Fail);
        }

        let store = self.open_cache(module, UpdateKind::Installed)?;
        let in_cache = is_package_in_cache(&store, name, version, arch)?;
        Ok(if in_cache == expect_present {
            Outcome::Change
        } else {
            warn!(
                package = name,
                expect_present, "package state after change does not match"
            );
            Outcome::Fail
        })
    }
}

/// Actuate `policy => "present"`.
#[tracing::instrument(skip_all, level = "debug", fields(package = promiser))]
pub async fn evaluate_present_promise(
    session: &PackageSession<'_>,
    module: &PackageModule,
    promiser: &str,
    attrs: &PackagePromiseAttrs,
) -> PackageResult<Outcome> {
    let Some(mut info) = module
        .get_package_data(
            promiser,
            attrs.version.as_deref(),
            attrs.architecture.as_deref(),
            &attrs.options,
        )
        .await?
    else {
        info!(package = promiser, "can not obtain package data for promise");
        return Ok(Outcome::Fail);
    };

    match info.package_type {
        Some(PackageType::File) => {
            if attrs.version.as_deref() == Some("latest") {
                warn!(package = promiser, "version 'latest' is not supported for file packages");
                return Ok(Outcome::Fail);
            }
            let arch_mismatch = matches!(
                (&info.arch, &attrs.architecture),
                (Some(found), Some(wanted)) if found != wanted
            );
            let version_mismatch = matches!(
                (&info.version, &attrs.version),
                (Some(found), Some(wanted)) if found != wanted
            );
            if arch_mismatch || version_mismatch {
                warn!(package = promiser, "package file does not match the promised version/architecture");
                return Ok(Outcome::Fail);
            }
        }
        Some(PackageType::Repo) => {
            // Only the name is expected from get-package-data for repo
            // packages; anything else is provider noise.
            info.version = None;
            info.arch = None;
        }
        None => return Ok(Outcome::Fail),
    }

    if info.version.is_none() {
        info.version = attrs.version.clone();
    }
    if info.arch.is_none() {
        info.arch = attrs.architecture.clone();
    }
    let name = info.name.clone().unwrap_or_else(|| promiser.to_string());

    let in_cache = session
        .is_in_cache(module, &name, info.version.as_deref(), info.arch.as_deref())
        .await?;

    match info.package_type {
        Some(PackageType::File) => {
            if in_cache {
                debug!(package = promiser, "package exists in cache, skipping installation");
                return Ok(Outcome::Noop);
            }
            if session.dry_run {
                info!(package = promiser, "dry-run: would install file package");
                return Ok(Outcome::Change);
            }
            let request = Request::new()
                .options(&attrs.options)
                .attribute("File", promiser);
            if !module.install(PackageType::File, request).await? {
                return Ok(Outcome::Fail);
            }
            session
                .validate_changed_package(
                    module,
                    &name,
                    info.version.as_deref(),
                    info.arch.as_deref(),
                    true,
                )
                .await
        }
        Some(PackageType::Repo) => {
            repo_install(session, module, &name, attrs, in_cache).await
        }
        None => Ok(Outcome::Fail),
    }
}

async fn repo_install(
    session: &PackageSession<'_>,
    module: &PackageModule,
    name: &str,
    attrs: &PackagePromiseAttrs,
    in_cache: bool,
) -> PackageResult<Outcome> {
    let latest = attrs.version.as_deref() == Some("latest");

    if !in_cache {
        session.refresh_cache(module, UpdateKind::Updates, false).await?;
        if session.dry_run {
            info!(package = name, "dry-run: would install repo package");
            return Ok(Outcome::Change);
        }
        let version = attrs.version.as_deref().filter(|v| *v != "latest");
        let request = Request::new()
            .options(&attrs.options)
            .attribute("Name", name)
            .optional("Version", version)
            .optional("Architecture", attrs.architecture.as_deref());
        if !module.install(PackageType::Repo, request).await? {
            return Ok(Outcome::Fail);
        }
        return session
            .validate_changed_package(
                module,
                name,
                attrs.version.as_deref(),
                attrs.architecture.as_deref(),
                true,
            )
            .await;
    }

    if !latest {
        debug!(package = name, "package already installed");
        return Ok(Outcome::Noop);
    }

    // Latest requested: install every update whose (version, arch) is not
    // already the installed one. All architectures go in one request so a
    // multi-arch package is upgraded atomically.
    session.refresh_cache(module, UpdateKind::Updates, false).await?;
    let updates_store = session.open_cache(module, UpdateKind::Updates)?;
    let candidates = versions_from_updates(&updates_store, name)?;
    if candidates.is_empty() {
        debug!(package = name, "package is already at the latest version");
        return Ok(Outcome::Noop);
    }

    let installed = session.open_cache(module, UpdateKind::Installed)?;
    let mut request = Request::new().options(&attrs.options);
    let mut to_verify: Vec<(String, String)> = Vec::new();
    let mut outcome = Outcome::Noop;

    for (version, arch) in candidates {
        if let Some(wanted_arch) = &attrs.architecture {
            if wanted_arch != &arch {
                continue;
            }
        }
        if is_package_in_cache(&installed, name, Some(&version), Some(&arch))? {
            outcome = outcome.and(Outcome::Noop);
            continue;
        }
        request = request
            .attribute("Name", name)
            .attribute("Version", &version)
            .attribute("Architecture", &arch);
        to_verify.push((version, arch));
    }

    if to_verify.is_empty() {
        return Ok(outcome);
    }
    if session.dry_run {
        info!(package = name, updates = to_verify.len(), "dry-run: would upgrade repo package");
        return Ok(Outcome::Change);
    }

    if !module.install(PackageType::Repo, request).await? {
        return Ok(Outcome::Fail);
    }
    for (version, arch) in to_verify {
        let validated = session
            .validate_changed_package(module, name, Some(&version), Some(&arch), true)
            .await?;
        outcome = outcome.and(validated);
    }
    Ok(outcome)
}

/// Actuate `policy => "absent"`.
#[tracing::instrument(skip_all, level = "debug", fields(package = promiser))]
pub async fn evaluate_absent_promise(
    session: &PackageSession<'_>,
    module: &PackageModule,
    promiser: &str,
    attrs: &PackagePromiseAttrs,
) -> PackageResult<Outcome> {
    if attrs.version.as_deref() == Some("latest") {
        warn!(package = promiser, "version 'latest' is not valid for absent package promises");
        return Ok(Outcome::Fail);
    }

    let in_cache = session
        .is_in_cache(
            module,
            promiser,
            attrs.version.as_deref(),
            attrs.architecture.as_deref(),
        )
        .await?;

    if !in_cache {
        debug!(package = promiser, "package not installed, skipping removal");
        return Ok(Outcome::Noop);
    }
    if session.dry_run {
        info!(package = promiser, "dry-run: would remove package");
        return Ok(Outcome::Change);
    }

    if !module
        .remove(
            promiser,
            attrs.version.as_deref(),
            attrs.architecture.as_deref(),
            &attrs.options,
        )
        .await?
    {
        return Ok(Outcome::Fail);
    }

    session
        .validate_changed_package(
            module,
            promiser,
            attrs.version.as_deref(),
            attrs.architecture.as_deref(),
            false,
        )
        .await
}
