//! Per-provider caches of installed packages and available updates,
//! rebuilt from `list-installed` / `list-updates` replies.
//!
//! Installed entries are membership keys `N<name>`, `N<name>V<ver>`,
//! `N<name>A<arch>` and `N<name>V<ver>A<arch>`; updates keep per-name lists
//! of `V<ver>A<arch>` lines. Each cache also carries an `<inventory>` blob
//! of `name,version,arch` rows.

use tracing::{debug, warn};

use super::PackageResult;
use crate::store::KvStore;

pub const INVENTORY_KEY: &str = "<inventory>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Installed,
    Updates,
    LocalUpdates,
}

impl UpdateKind {
    pub fn cache_family(self) -> &'static str {
        match self {
            UpdateKind::Installed => "installed",
            UpdateKind::Updates | UpdateKind::LocalUpdates => "updates",
        }
    }
}

/// Rebuild a cache database from provider reply lines. Returns false when
/// the reply carried error lines; the cache is still rewritten with
/// whatever parsed.
pub fn rebuild_cache(store: &dyn KvStore, lines: &[String], kind: UpdateKind) -> PackageResult<bool> {
    store.clear()?;

    let mut clean = true;
    let mut inventory = String::new();
    let mut current: (Option<String>, Option<String>, Option<String>) = (None, None, None);

    let mut flush = |store: &dyn KvStore,
                     inventory: &mut String,
                     entry: &mut (Option<String>, Option<String>, Option<String>)|
     -> PackageResult<()> {
        if let (Some(name), Some(version), Some(arch)) = (&entry.0, &entry.1, &entry.2) {
            write_package(store, name, version, arch, kind)?;
            inventory.push_str(&format!("{name},{version},{arch}\n"));
        } else if entry.0.is_some() || entry.1.is_some() || entry.2.is_some() {
            warn!(?entry, "malformed package entry from module");
        }
        *entry = (None, None, None);
        Ok(())
    };

    for line in lines {
        if let Some(value) = line.strip_prefix("Name=") {
            if current.0.is_some() {
                flush(store, &mut inventory, &mut current)?;
            }
            current.0 = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("Version=") {
            current.1 = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("Architecture=") {
            current.2 = Some(value.to_string());
        } else if line.starts_with("Error=") || line.starts_with("ErrorMessage=") {
            warn!("package module: {line}");
            clean = false;
        } else {
            warn!("unsupported response from package module: {line}");
            clean = false;
        }
    }
    flush(store, &mut inventory, &mut current)?;

    if inventory.is_empty() {
        store.put(INVENTORY_KEY.as_bytes(), b"\n")?;
    } else {
        store.put(INVENTORY_KEY.as_bytes(), inventory.as_bytes())?;
    }
    Ok(clean)
}

fn write_package(
    store: &dyn KvStore,
    name: &str,
    version: &str,
    arch: &str,
    kind: UpdateKind,
) -> PackageResult<()> {
    let name_key = format!("N<{name}>");
    match kind {
        UpdateKind::Installed => {
            store.put(name_key.as_bytes(), b"1")?;
            store.put(format!("N<{name}>V<{version}>").as_bytes(), b"1")?;
            store.put(format!("N<{name}>A<{arch}>").as_bytes(), b"1")?;
            store.put(format!("N<{name}>V<{version}>A<{arch}>").as_bytes(), b"1")?;
        }
        UpdateKind::Updates | UpdateKind::LocalUpdates => {
            let mut value = store
                .get(name_key.as_bytes())?
                .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
                .unwrap_or_default();
            value.push_str(&format!("V<{version}>A<{arch}>\n"));
            store.put(name_key.as_bytes(), value.as_bytes())?;
        }
    }
    Ok(())
}

/// Membership test against the installed cache, keyed by whatever subset of
/// (version, architecture) the promise pinned down. A version of `latest`
/// matches any installed version.
pub fn is_package_in_cache(
    store: &dyn KvStore,
    name: &str,
    version: Option<&str>,
    arch: Option<&str>,
) -> PackageResult<bool> {
    let version = version.filter(|v| *v != "latest");
    let key = match (version, arch) {
        (Some(v), Some(a)) => format!("N<{name}>V<{v}>A<{a}>"),
        (Some(v), None) => format!("N<{name}>V<{v}>"),
        (None, Some(a)) => format!("N<{name}>A<{a}>"),
        (None, None) => format!("N<{name}>"),
    };
    debug!(key, "looking for key in installed packages cache");
    Ok(store.get(key.as_bytes())?.is_some_and(|v| v == b"1"))
}

/// The `(version, architecture)` pairs the updates cache knows for a name.
pub fn versions_from_updates(
    store: &dyn KvStore,
    name: &str,
) -> PackageResult<Vec<(String, String)>> {
    let Some(raw) = store.get(format!("N<{name}>").as_bytes())? else {
        return Ok(Vec::new());
    };
    let text = String::from_utf8_lossy(&raw);
    let mut pairs = Vec::new();
    for line in text.lines().filter(|l| !l.is_empty()) {
        match parse_update_line(line) {
            Some(pair) => pairs.push(pair),
            None => warn!(line, "unable to parse available updates line"),
        }
    }
    Ok(pairs)
}

fn parse_update_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("V<")?;
    let (version, rest) = rest.split_once(">A<")?;
    let arch = rest.strip_suffix('>')?;
    Some((version.to_string(), arch.to_string()))
}
