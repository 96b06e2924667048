//! The line-oriented protocol spoken to an out-of-process package provider:
//! one verb as the command-line argument, `Key=Value` attribute lines on
//! stdin terminated by a blank line, `Key=Value` reply lines on stdout.

use std::process::Stdio;
use std::time::Duration;

use strum_macros::{AsRefStr, Display, EnumString};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{PackageError, PackageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Verb {
    SupportsApiVersion,
    GetPackageData,
    ListInstalled,
    ListUpdates,
    ListUpdatesLocal,
    RepoInstall,
    FileInstall,
    Remove,
    /// Spoken to custom promise-type modules, not package providers.
    EvaluatePromise,
}

/// Accumulates the `Key=Value` payload of one request.
#[derive(Debug, Clone, Default)]
pub struct Request {
    lines: Vec<String>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(mut self, key: &str, value: &str) -> Self {
        self.lines.push(format!("{key}={value}"));
        self
    }

    pub fn optional(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.attribute(key, value),
            None => self,
        }
    }

    pub fn options(mut self, options: &[String]) -> Self {
        for option in options {
            self.lines.push(format!("options={option}"));
        }
        self
    }

    /// Wire form: attribute lines, then the terminating blank line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// How to start the provider process.
#[derive(Debug, Clone)]
pub struct ModuleExec {
    /// The executable: the module itself, or its interpreter.
    pub program: String,
    /// Interpreter options and the script path, when an interpreter is used.
    pub pre_args: Vec<String>,
}

impl ModuleExec {
    pub fn direct(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            pre_args: Vec::new(),
        }
    }
}

/// Run one exchange with the provider. The whole exchange is bounded by
/// `timeout`; on expiry the child is killed, with `kill_grace` to die in.
pub async fn communicate(
    exec: &ModuleExec,
    verb: Verb,
    request: &Request,
    timeout: Duration,
    kill_grace: Duration,
) -> PackageResult<Vec<String>> {
    debug!(program = %exec.program, verb = %verb, "package module exchange");

    let mut command = Command::new(&exec.program);
    command
        .args(&exec.pre_args)
        .arg(verb.as_ref())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| PackageError::Spawn {
        program: exec.program.clone(),
        source,
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(request.render().as_bytes())
            .await
            .map_err(|source| PackageError::Pipe {
                program: exec.program.clone(),
                source,
            })?;
        // Dropping stdin closes the pipe; the provider sees EOF.
    }

    let mut stdout = child.stdout.take().ok_or_else(|| PackageError::Pipe {
        program: exec.program.clone(),
        source: std::io::Error::other("no stdout pipe"),
    })?;

    let mut output = Vec::new();
    let read = tokio::time::timeout(timeout, stdout.read_to_end(&mut output)).await;
    match read {
        Ok(Ok(_)) => {}
        Ok(Err(source)) => {
            let _ = child.kill().await;
            return Err(PackageError::Pipe {
                program: exec.program.clone(),
                source,
            });
        }
        Err(_) => {
            warn!(program = %exec.program, "package module timed out, killing it");
            let _ = child.kill().await;
            let _ = tokio::time::timeout(kill_grace, child.wait()).await;
            return Err(PackageError::Timeout {
                program: exec.program.clone(),
                verb: verb.to_string(),
            });
        }
    }

    let status = match tokio::time::timeout(kill_grace, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => {
            return Err(PackageError::Pipe {
                program: exec.program.clone(),
                source,
            });
        }
        Err(_) => {
            warn!(program = %exec.program, "package module did not exit, killing it");
            let _ = child.kill().await;
            return Err(PackageError::Timeout {
                program: exec.program.clone(),
                verb: verb.to_string(),
            });
        }
    };

    if !status.success() {
        return Err(PackageError::ModuleFailed {
            program: exec.program.clone(),
            verb: verb.to_string(),
            code: status.code().unwrap_or(-1),
        });
    }

    Ok(String::from_utf8_lossy(&output)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// One package as described by a provider reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageInfo {
    pub package_type: Option<PackageType>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PackageType {
    File,
    Repo,
}

/// Parse a `get-package-data` reply. Error lines are surfaced in the log;
/// unknown keys are logged and ignored; a duplicated field voids the reply.
pub fn parse_package_data(lines: &[String]) -> Option<PackageInfo> {
    let mut info = PackageInfo::default();
    for line in lines {
        if let Some(value) = line.strip_prefix("PackageType=") {
            match value.parse::<PackageType>() {
                Ok(kind) => info.package_type = Some(kind),
                Err(_) => {
                    warn!(value, "unsupported package type");
                    return None;
                }
            }
        } else if let Some(value) = line.strip_prefix("Name=") {
            if info.name.is_some() {
                warn!(line, "extraneous package name line received");
                return None;
            }
            info.name = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("Version=") {
            if info.version.is_some() {
                warn!(line, "extraneous package version line received");
                return None;
            }
            info.version = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("Architecture=") {
            if info.arch.is_some() {
                warn!(line, "extraneous package architecture line received");
                return None;
            }
            info.arch = Some(value.to_string());
        } else if line.starts_with("Error=") || line.starts_with("ErrorMessage=") {
            warn!("package module: {line}");
        } else {
            debug!("unsupported response from package module: {line}");
        }
    }

    if info.name.is_none() || info.package_type.is_none() {
        warn!("package module reply missing name or type");
        return None;
    }
    Some(info)
}

/// True when a mutation reply carries an error; the lines are logged.
pub fn reply_reports_error(lines: &[String]) -> bool {
    let mut failed = false;
    for line in lines {
        if line.starts_with("Error=") || line.starts_with("ErrorMessage=") {
            warn!("package module: {line}");
            failed = true;
        } else {
            debug!("unsupported response from package module: {line}");
        }
    }
    failed
}
