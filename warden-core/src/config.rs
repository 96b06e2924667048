use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment overrides honoured by the engine. Values are paths; unset
/// variables fall back to the compiled defaults below.
pub const ENV_WORK_DIR: &str = "WARDEN_WORKDIR";
pub const ENV_STATE_DIR: &str = "WARDEN_STATEDIR";
pub const ENV_MODULE_DIR: &str = "WARDEN_MODULEDIR";

const DEFAULT_WORK_DIR: &str = "/var/lib/warden";

/// Configuration for one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Root of the agent's writable tree.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Databases and the change log live here. Defaults to `<work_dir>/state`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Package modules live here. Defaults to `<work_dir>/modules/packages`.
    #[serde(default)]
    pub module_dir: Option<PathBuf>,

    /// Report would-be repairs without touching the host.
    #[serde(default)]
    pub dry_run: bool,

    /// Hard deadline for one exchange with a package module.
    #[serde(default = "default_module_timeout", with = "duration_secs")]
    pub module_timeout: Duration,

    /// Poll interval while waiting for a package module to exit.
    #[serde(default = "default_module_poll", with = "duration_secs")]
    pub module_poll: Duration,

    /// Default ifelapsed throttle for promise locks, in minutes.
    #[serde(default = "default_ifelapsed")]
    pub ifelapsed_minutes: u64,

    /// Default expireafter for promise locks, in minutes.
    #[serde(default = "default_expireafter")]
    pub expireafter_minutes: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            state_dir: None,
            module_dir: None,
            dry_run: false,
            module_timeout: default_module_timeout(),
            module_poll: default_module_poll(),
            ifelapsed_minutes: default_ifelapsed(),
            expireafter_minutes: default_expireafter(),
        }
    }
}

impl RunConfig {
    /// Compiled defaults overlaid with any `WARDEN_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var(ENV_WORK_DIR) {
            config.work_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
            config.state_dir = Some(PathBuf::from(dir));
        }
        if let Ok(dir) = std::env::var(ENV_MODULE_DIR) {
            config.module_dir = Some(PathBuf::from(dir));
        }
        config
    }

    pub fn with_work_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.work_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("state"))
    }

    pub fn module_dir(&self) -> PathBuf {
        self.module_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("modules").join("packages"))
    }

    pub fn change_db_path(&self) -> PathBuf {
        self.state_dir().join("changes.db")
    }

    pub fn lock_db_path(&self) -> PathBuf {
        self.state_dir().join("locks.db")
    }

    pub fn persistent_class_db_path(&self) -> PathBuf {
        self.state_dir().join("classes.db")
    }

    pub fn package_cache_path(&self, provider: &str, family: &str) -> PathBuf {
        self.state_dir()
            .join(format!("packages_{family}_{provider}.db"))
    }

    pub fn change_log_path(&self) -> PathBuf {
        self.state_dir().join("file_changes.log")
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(DEFAULT_WORK_DIR)
}

fn default_module_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_module_poll() -> Duration {
    Duration::from_secs(1)
}

fn default_ifelapsed() -> u64 {
    1
}

fn default_expireafter() -> u64 {
    120
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
