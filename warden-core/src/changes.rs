//! Change tracking: a durable database of per-file content digests, stat
//! fingerprints and directory indices, plus the append-only change log.
//!
//! Key layout inside the single database:
//!
//! ```text
//! D_<absolute-dir-path>            -> "<basename>\0<basename>\0..." (sorted)
//! H_<7-byte-tag>\0<absolute-path>  -> raw digest bytes
//! S_<absolute-path>                -> packed stat record (6 x u64, LE)
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{KvStore, SqliteStore, StoreError};

#[derive(Error, Debug)]
pub enum ChangeError {
    #[error("changes database: {0}")]
    Store(#[from] StoreError),

    #[error("i/o on '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("change log '{path}' is writable by group/other (security exception)")]
    UnsafeLog { path: String },

    #[error("corrupt stat record for '{0}'")]
    CorruptStat(String),
}

pub type ChangeResult<T> = std::result::Result<T, ChangeError>;

const TAG_LEN: usize = 7;

/// Digest algorithms the tracker can record, named by their stored tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum HashAlgo {
    #[strum(serialize = "md5")]
    Md5,
    #[strum(serialize = "sha1")]
    Sha1,
    #[strum(serialize = "sha224")]
    Sha224,
    #[strum(serialize = "sha256")]
    Sha256,
    #[strum(serialize = "sha384")]
    Sha384,
    #[strum(serialize = "sha512")]
    Sha512,
    /// The strongest available digest.
    #[strum(serialize = "best")]
    Best,
}

impl HashAlgo {
    /// The 7-byte tag stored in `H_` keys, NUL padded.
    pub fn tag(self) -> [u8; TAG_LEN] {
        let name = match self {
            HashAlgo::Md5 => "MD5",
            HashAlgo::Sha1 => "SHA1",
            HashAlgo::Sha224 => "SHA224",
            HashAlgo::Sha256 => "SHA256",
            HashAlgo::Sha384 => "SHA384",
            HashAlgo::Sha512 => "SHA512",
            HashAlgo::Best => "SHA512",
        };
        let mut tag = [0u8; TAG_LEN];
        tag[..name.len()].copy_from_slice(name.as_bytes());
        tag
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgo::Md5 => 16,
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha224 => 28,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha384 => 48,
            HashAlgo::Sha512 | HashAlgo::Best => 64,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgo::Md5 => Md5::digest(data).to_vec(),
            HashAlgo::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgo::Sha224 => Sha224::digest(data).to_vec(),
            HashAlgo::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgo::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgo::Sha512 | HashAlgo::Best => Sha512::digest(data).to_vec(),
        }
    }

    pub fn digest_file(self, path: &Path) -> ChangeResult<Vec<u8>> {
        let mut file = File::open(path).map_err(|source| ChangeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(|source| ChangeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(self.digest(&data))
    }

    /// Every concrete algorithm, for erasing all traces of a file.
    pub fn all() -> &'static [HashAlgo] {
        &[
            HashAlgo::Md5,
            HashAlgo::Sha1,
            HashAlgo::Sha224,
            HashAlgo::Sha256,
            HashAlgo::Sha384,
            HashAlgo::Sha512,
        ]
    }
}

/// Stat fields the tracker fingerprints. Stored as six little-endian u64s
/// so state files are portable between hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatRecord {
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
    pub dev: u64,
    pub ino: u64,
    pub mtime: i64,
}

impl StatRecord {
    pub const PACKED_LEN: usize = 48;

    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            mode: meta.mode() as u64,
            uid: meta.uid() as u64,
            gid: meta.gid() as u64,
            dev: meta.dev(),
            ino: meta.ino(),
            mtime: meta.mtime(),
        }
    }

    pub fn to_bytes(self) -> [u8; Self::PACKED_LEN] {
        let mut buf = [0u8; Self::PACKED_LEN];
        for (slot, value) in [
            self.mode,
            self.uid,
            self.gid,
            self.dev,
            self.ino,
            self.mtime as u64,
        ]
        .into_iter()
        .enumerate()
        {
            buf[slot * 8..slot * 8 + 8].copy_from_slice(&value.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::PACKED_LEN {
            return None;
        }
        let word = |slot: usize| {
            u64::from_le_bytes(bytes[slot * 8..slot * 8 + 8].try_into().unwrap())
        };
        Some(Self {
            mode: word(0),
            uid: word(1),
            gid: word(2),
            dev: word(3),
            ino: word(4),
            mtime: word(5) as i64,
        })
    }
}

/// What a file-change event was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    New,
    Removed,
    ContentChanged,
    StatsChanged,
}

impl FileState {
    fn code(self) -> char {
        match self {
            FileState::New => 'N',
            FileState::Removed => 'R',
            FileState::ContentChanged => 'C',
            FileState::StatsChanged => 'S',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStatus {
    /// First sighting; the digest was recorded.
    New,
    Unchanged,
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatStatus {
    New,
    Unchanged,
    Changed,
}

fn hash_key(algo: HashAlgo, path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + TAG_LEN + 1 + path.len());
    key.extend_from_slice(b"H_");
    key.extend_from_slice(&algo.tag());
    key.push(0);
    key.extend_from_slice(path.as_bytes());
    key
}

fn stat_key(path: &str) -> Vec<u8> {
    format!("S_{path}").into_bytes()
}

fn dir_key(path: &str) -> Vec<u8> {
    format!("D_{path}").into_bytes()
}

/// The tracker itself: one store plus the text change log.
pub struct ChangeDb {
    store: Box<dyn KvStore>,
    log_path: PathBuf,
}

impl ChangeDb {
    pub fn new(store: Box<dyn KvStore>, log_path: PathBuf) -> Self {
        Self { store, log_path }
    }

    // ---- content hashes -------------------------------------------------

    /// Compare a freshly computed digest against the recorded one.
    /// A changed digest is overwritten only under `update`; both the first
    /// sighting and an accepted change are logged.
    pub fn check_and_update_hash(
        &self,
        path: &str,
        algo: HashAlgo,
        digest: &[u8],
        update: bool,
        handle: Option<&str>,
        now: i64,
    ) -> ChangeResult<HashStatus> {
        let key = hash_key(algo, path);
        match self.store.get(&key)? {
            None => {
                self.store.put(&key, digest)?;
                debug!(path, algo = %algo, "stored first digest");
                Ok(HashStatus::New)
            }
            Some(recorded) if recorded == digest => Ok(HashStatus::Unchanged),
            Some(_) => {
                info!(path, algo = %algo, "content hash changed");
                self.log_change(
                    path,
                    FileState::ContentChanged,
                    &format!("Content hash ({algo}) changed"),
                    handle,
                    now,
                )?;
                if update {
                    self.store.put(&key, digest)?;
                }
                Ok(HashStatus::Changed)
            }
        }
    }

    pub fn read_hash(&self, path: &str, algo: HashAlgo) -> ChangeResult<Option<Vec<u8>>> {
        Ok(self.store.get(&hash_key(algo, path))?)
    }

    // ---- stat fingerprints ----------------------------------------------

    /// Compare the current stat fields against the record, logging one
    /// descriptive line per changed field. Write-back only under `update`.
    pub fn check_and_update_stats(
        &self,
        path: &str,
        stat: &StatRecord,
        update: bool,
        handle: Option<&str>,
        now: i64,
    ) -> ChangeResult<StatStatus> {
        let key = stat_key(path);
        let Some(recorded) = self.store.get(&key)? else {
            self.store.put(&key, &stat.to_bytes())?;
            debug!(path, "stored first stat record");
            return Ok(StatStatus::New);
        };
        let recorded = StatRecord::from_bytes(&recorded)
            .ok_or_else(|| ChangeError::CorruptStat(path.to_string()))?;

        if recorded == *stat {
            return Ok(StatStatus::Unchanged);
        }

        if recorded.mode != stat.mode {
            let message = format!("Permission: {:04o} -> {:04o}", recorded.mode, stat.mode);
            info!(path, %message, "stat change");
            self.log_change(path, FileState::StatsChanged, &message, handle, now)?;
        }
        if recorded.uid != stat.uid {
            let message = format!("Owner: {} -> {}", recorded.uid, stat.uid);
            info!(path, %message, "stat change");
            self.log_change(path, FileState::StatsChanged, &message, handle, now)?;
        }
        if recorded.gid != stat.gid {
            let message = format!("Group: {} -> {}", recorded.gid, stat.gid);
            info!(path, %message, "stat change");
            self.log_change(path, FileState::StatsChanged, &message, handle, now)?;
        }
        if recorded.dev != stat.dev {
            let message = format!("Device: {} -> {}", recorded.dev, stat.dev);
            info!(path, %message, "stat change");
            self.log_change(path, FileState::StatsChanged, &message, handle, now)?;
        }
        if recorded.ino != stat.ino {
            info!(path, from = recorded.ino, to = stat.ino, "inode changed");
        }
        if recorded.mtime != stat.mtime {
            let message = format!(
                "Modified time: {} -> {}",
                ctime(recorded.mtime),
                ctime(stat.mtime)
            );
            info!(path, %message, "stat change");
            self.log_change(path, FileState::StatsChanged, &message, handle, now)?;
        }

        if update {
            self.store.put(&key, &stat.to_bytes())?;
        }
        Ok(StatStatus::Changed)
    }

    // ---- directory indices ----------------------------------------------

    pub fn directory_list(&self, path: &str) -> ChangeResult<Vec<String>> {
        let Some(raw) = self.store.get(&dir_key(path))? else {
            return Ok(Vec::new());
        };
        Ok(raw
            .split(|b| *b == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| String::from_utf8_lossy(chunk).to_string())
            .collect())
    }

    /// Persist a sorted set of basenames; an empty set deletes the entry.
    /// Returns whether anything changed.
    pub fn set_directory_list(&self, path: &str, names: &[String]) -> ChangeResult<bool> {
        let key = dir_key(path);
        if names.is_empty() {
            return Ok(self.store.delete(&key)?);
        }
        let mut packed = Vec::new();
        for name in names {
            packed.extend_from_slice(name.as_bytes());
            packed.push(0);
        }
        if let Some(existing) = self.store.get(&key)? {
            if existing == packed {
                debug!(path, "no changes in directory list");
                return Ok(false);
            }
        }
        self.store.put(&key, &packed)?;
        Ok(true)
    }

    /// Merge-join the on-disk children against the recorded set. Children
    /// only on disk are new (their announcement happens where the walk saw
    /// them); children only in the database have been removed and their
    /// traces are erased. The new sorted set is persisted under `update`.
    ///
    /// Note the index stores basenames only, which cannot disambiguate
    /// names differing by case if the filesystem's sensitivity changes.
    pub fn check_and_update_directory(
        &self,
        path: &str,
        on_disk: &[String],
        update: bool,
        handle: Option<&str>,
        now: i64,
    ) -> ChangeResult<(usize, usize)> {
        let mut disk_sorted: Vec<String> = on_disk.to_vec();
        disk_sorted.sort();
        let recorded = self.directory_list(path)?;

        let mut new_count = 0usize;
        let mut removed_count = 0usize;

        let (mut disk_pos, mut db_pos) = (0usize, 0usize);
        while disk_pos < disk_sorted.len() || db_pos < recorded.len() {
            let order = if disk_pos >= disk_sorted.len() {
                std::cmp::Ordering::Greater
            } else if db_pos >= recorded.len() {
                std::cmp::Ordering::Less
            } else {
                disk_sorted[disk_pos].cmp(&recorded[db_pos])
            };

            match order {
                std::cmp::Ordering::Less => {
                    new_count += 1;
                    disk_pos += 1;
                }
                std::cmp::Ordering::Greater => {
                    let child = format!("{}/{}", path.trim_end_matches('/'), recorded[db_pos]);
                    info!(path = %child, "file no longer exists");
                    self.log_change(&child, FileState::Removed, "File removed", handle, now)?;
                    self.remove_all_traces(&child)?;
                    removed_count += 1;
                    db_pos += 1;
                }
                std::cmp::Ordering::Equal => {
                    disk_pos += 1;
                    db_pos += 1;
                }
            }
        }

        if update {
            self.set_directory_list(path, &disk_sorted)?;
        }
        Ok((new_count, removed_count))
    }

    /// Remove every hash and stat record for a path.
    pub fn remove_all_traces(&self, path: &str) -> ChangeResult<()> {
        for algo in HashAlgo::all() {
            self.store.delete(&hash_key(*algo, path))?;
        }
        self.store.delete(&stat_key(path))?;
        Ok(())
    }

    // ---- the change log -------------------------------------------------

    pub fn log_new_file(&self, path: &str, handle: Option<&str>, now: i64) -> ChangeResult<()> {
        info!(path, "new file found");
        self.log_change(path, FileState::New, "New file found", handle, now)
    }

    /// Append one event line:
    /// `<unix-ts>,<handle-or-empty>,<path>,<N|R|C|S>,<free-text>`.
    /// Refuses to log into a group/other-writable file; fsyncs after append.
    pub fn log_change(
        &self,
        path: &str,
        state: FileState,
        message: &str,
        handle: Option<&str>,
        now: i64,
    ) -> ChangeResult<()> {
        #[cfg(unix)]
        if let Ok(meta) = std::fs::metadata(&self.log_path) {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o022 != 0 {
                warn!(log = %self.log_path.display(), "change log is writable by others");
                return Err(ChangeError::UnsafeLog {
                    path: self.log_path.display().to_string(),
                });
            }
        }

        if let Some(parent) = self.log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let io_err = |source: std::io::Error| ChangeError::Io {
            path: self.log_path.display().to_string(),
            source,
        };
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(io_err)?;
        writeln!(
            log,
            "{},{},{},{},{}",
            now,
            handle.unwrap_or(""),
            path,
            state.code(),
            message
        )
        .map_err(io_err)?;
        log.sync_all().map_err(io_err)?;
        Ok(())
    }
}

/// Classic ctime rendering without the trailing newline,
/// e.g. `Thu Nov 24 18:22:48 1986`.
fn ctime(timestamp: i64) -> String {
    use chrono::TimeZone;
    match chrono::Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(when) => when.format("%a %b %e %H:%M:%S %Y").to_string(),
        _ => format!("@{timestamp}"),
    }
}

/// Import records from the two legacy single-purpose databases, then move
/// them out of the way with a suffix so migration happens once.
pub fn migrate_legacy_databases(
    changes: &ChangeDb,
    legacy_checksums: &Path,
    legacy_stats: &Path,
) -> ChangeResult<()> {
    if legacy_checksums.exists() {
        info!(db = %legacy_checksums.display(), "migrating legacy checksum database");
        let old = SqliteStore::open(legacy_checksums)?;
        for (key, value) in old.scan_prefix(b"")? {
            let mut new_key = Vec::with_capacity(key.len() + 2);
            new_key.extend_from_slice(b"H_");
            new_key.extend_from_slice(&key);
            changes.store.put(&new_key, &value)?;
            // Legacy checksum keys are "<7-byte tag>\0<path>".
            if key.len() > TAG_LEN + 1 {
                let path = String::from_utf8_lossy(&key[TAG_LEN + 1..]).to_string();
                add_to_directory_index(changes, &path)?;
            }
        }
        rename_migrated(legacy_checksums)?;
    }

    if legacy_stats.exists() {
        info!(db = %legacy_stats.display(), "migrating legacy filestat database");
        let old = SqliteStore::open(legacy_stats)?;
        for (key, value) in old.scan_prefix(b"")? {
            let mut new_key = Vec::with_capacity(key.len() + 2);
            new_key.extend_from_slice(b"S_");
            new_key.extend_from_slice(&key);
            changes.store.put(&new_key, &value)?;
            let path = String::from_utf8_lossy(&key).to_string();
            add_to_directory_index(changes, &path)?;
        }
        rename_migrated(legacy_stats)?;
    }

    Ok(())
}

fn add_to_directory_index(changes: &ChangeDb, file: &str) -> ChangeResult<()> {
    let path = Path::new(file);
    let (Some(parent), Some(base)) = (path.parent(), path.file_name()) else {
        warn!(file, "invalid file entry while migrating");
        return Ok(());
    };
    let parent = parent.display().to_string();
    let base = base.to_string_lossy().to_string();

    let mut names = changes.directory_list(&parent)?;
    if names.binary_search(&base).is_err() {
        names.push(base);
        names.sort();
        changes.set_directory_list(&parent, &names)?;
    }
    Ok(())
}

fn rename_migrated(path: &Path) -> ChangeResult<()> {
    let mut renamed = path.as_os_str().to_os_string();
    renamed.push(".migrated");
    std::fs::rename(path, &renamed).map_err(|source| ChangeError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn tracker() -> (tempfile::TempDir, ChangeDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = ChangeDb::new(Box::new(MemStore::new()), dir.path().join("file_changes.log"));
        (dir, db)
    }

    fn read_log(dir: &tempfile::TempDir) -> String {
        std::fs::read_to_string(dir.path().join("file_changes.log")).unwrap_or_default()
    }

    #[test]
    fn digests_have_expected_sizes() {
        for algo in HashAlgo::all() {
            assert_eq!(algo.digest(b"warden").len(), algo.digest_len());
        }
        assert_eq!(HashAlgo::Best.digest(b"x"), HashAlgo::Sha512.digest(b"x"));
    }

    #[test]
    fn known_sha256_digest() {
        let digest = HashAlgo::Sha256.digest(b"");
        assert_eq!(
            hex::encode(digest),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hash_keys_embed_padded_tag() {
        let key = hash_key(HashAlgo::Md5, "/etc/passwd");
        assert_eq!(&key[..2], b"H_");
        assert_eq!(&key[2..9], b"MD5\0\0\0\0");
        assert_eq!(key[9], 0);
        assert_eq!(&key[10..], b"/etc/passwd");
    }

    #[test]
    fn first_sighting_then_unchanged_then_changed() {
        let (dir, db) = tracker();
        let d1 = HashAlgo::Sha256.digest(b"one");
        let d2 = HashAlgo::Sha256.digest(b"two");

        let status = db
            .check_and_update_hash("/f", HashAlgo::Sha256, &d1, true, Some("h1"), 100)
            .unwrap();
        assert_eq!(status, HashStatus::New);

        // Unchanged immediately after a successful write of the same digest.
        let status = db
            .check_and_update_hash("/f", HashAlgo::Sha256, &d1, true, Some("h1"), 101)
            .unwrap();
        assert_eq!(status, HashStatus::Unchanged);

        let status = db
            .check_and_update_hash("/f", HashAlgo::Sha256, &d2, true, Some("h1"), 102)
            .unwrap();
        assert_eq!(status, HashStatus::Changed);
        assert!(read_log(&dir).contains(",h1,/f,C,"));

        // The update flag caused a write-back.
        assert_eq!(db.read_hash("/f", HashAlgo::Sha256).unwrap(), Some(d2));
    }

    #[test]
    fn changed_hash_without_update_keeps_old_record() {
        let (_dir, db) = tracker();
        let d1 = HashAlgo::Sha1.digest(b"one");
        let d2 = HashAlgo::Sha1.digest(b"two");
        db.check_and_update_hash("/f", HashAlgo::Sha1, &d1, false, None, 100)
            .unwrap();
        db.check_and_update_hash("/f", HashAlgo::Sha1, &d2, false, None, 101)
            .unwrap();
        assert_eq!(db.read_hash("/f", HashAlgo::Sha1).unwrap(), Some(d1));
    }

    #[test]
    fn stat_record_roundtrip_is_little_endian() {
        let record = StatRecord {
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            dev: 2049,
            ino: 123456,
            mtime: 1_700_000_000,
        };
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), StatRecord::PACKED_LEN);
        assert_eq!(bytes[0], (0o100644 & 0xff) as u8);
        assert_eq!(StatRecord::from_bytes(&bytes), Some(record));
    }

    #[test]
    fn stat_changes_log_each_field() {
        let (dir, db) = tracker();
        let before = StatRecord {
            mode: 0o100644,
            uid: 0,
            gid: 0,
            dev: 1,
            ino: 2,
            mtime: 1000,
        };
        assert_eq!(
            db.check_and_update_stats("/f", &before, true, None, 100).unwrap(),
            StatStatus::New
        );
        assert_eq!(
            db.check_and_update_stats("/f", &before, true, None, 101).unwrap(),
            StatStatus::Unchanged
        );

        let after = StatRecord {
            mode: 0o100600,
            uid: 33,
            ..before
        };
        assert_eq!(
            db.check_and_update_stats("/f", &after, true, Some("st"), 102)
                .unwrap(),
            StatStatus::Changed
        );
        let log = read_log(&dir);
        assert!(log.contains("Permission: 100644 -> 100600"));
        assert!(log.contains("Owner: 0 -> 33"));

        // Updated record now matches.
        assert_eq!(
            db.check_and_update_stats("/f", &after, true, None, 103).unwrap(),
            StatStatus::Unchanged
        );
    }

    #[test]
    fn directory_lists_store_sorted() {
        let (_dir, db) = tracker();
        let names = vec!["zeta".to_string(), "alpha".to_string()];
        let mut sorted = names.clone();
        sorted.sort();
        assert!(db.set_directory_list("/d", &sorted).unwrap());
        assert_eq!(db.directory_list("/d").unwrap(), sorted);

        // Unchanged set is detected.
        assert!(!db.set_directory_list("/d", &sorted).unwrap());

        // Empty set removes the entry.
        assert!(db.set_directory_list("/d", &[]).unwrap());
        assert!(db.directory_list("/d").unwrap().is_empty());
    }

    #[test]
    fn directory_diff_detects_new_and_removed() {
        let (dir, db) = tracker();
        db.set_directory_list("/d", &["a".into(), "b".into()]).unwrap();
        db.check_and_update_hash("/d/b", HashAlgo::Sha256, b"x", true, None, 1)
            .unwrap();

        let on_disk = vec!["a".to_string(), "c".to_string()];
        let (new, removed) = db
            .check_and_update_directory("/d", &on_disk, true, Some("dirh"), 200)
            .unwrap();
        assert_eq!((new, removed), (1, 1));

        // The removed child lost its traces and the log shows it.
        assert_eq!(db.read_hash("/d/b", HashAlgo::Sha256).unwrap(), None);
        assert!(read_log(&dir).contains(",dirh,/d/b,R,File removed"));

        // The stored set is now the sorted on-disk one.
        assert_eq!(db.directory_list("/d").unwrap(), vec!["a", "c"]);
    }

    #[test]
    fn log_line_shape() {
        let (dir, db) = tracker();
        db.log_change("/etc/x", FileState::New, "New file found", Some("handle_1"), 1234)
            .unwrap();
        let log = read_log(&dir);
        assert_eq!(log, "1234,handle_1,/etc/x,N,New file found\n");
    }

    #[cfg(unix)]
    #[test]
    fn group_writable_log_is_refused() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, db) = tracker();
        let log_path = dir.path().join("file_changes.log");
        std::fs::write(&log_path, "").unwrap();
        std::fs::set_permissions(&log_path, std::fs::Permissions::from_mode(0o666)).unwrap();

        let result = db.log_change("/x", FileState::New, "m", None, 1);
        assert!(matches!(result, Err(ChangeError::UnsafeLog { .. })));
    }

    #[test]
    fn legacy_databases_migrate_once() {
        let dir = tempfile::tempdir().unwrap();
        let changes = ChangeDb::new(
            Box::new(MemStore::new()),
            dir.path().join("file_changes.log"),
        );

        let checksums_path = dir.path().join("checksums.db");
        {
            let legacy = SqliteStore::open(&checksums_path).unwrap();
            let mut key = HashAlgo::Sha256.tag().to_vec();
            key.push(0);
            key.extend_from_slice(b"/etc/passwd");
            legacy.put(&key, b"\x01\x02\x03").unwrap();
        }
        let stats_path = dir.path().join("filestats.db");
        {
            let legacy = SqliteStore::open(&stats_path).unwrap();
            legacy
                .put(
                    b"/etc/passwd",
                    &StatRecord {
                        mode: 0o100644,
                        uid: 0,
                        gid: 0,
                        dev: 1,
                        ino: 9,
                        mtime: 5,
                    }
                    .to_bytes(),
                )
                .unwrap();
        }

        migrate_legacy_databases(&changes, &checksums_path, &stats_path).unwrap();

        assert!(!checksums_path.exists());
        assert!(dir.path().join("checksums.db.migrated").exists());
        assert!(dir.path().join("filestats.db.migrated").exists());

        assert_eq!(
            changes.read_hash("/etc/passwd", HashAlgo::Sha256).unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(changes.directory_list("/etc").unwrap(), vec!["passwd"]);
        assert_eq!(
            changes
                .check_and_update_stats(
                    "/etc/passwd",
                    &StatRecord {
                        mode: 0o100644,
                        uid: 0,
                        gid: 0,
                        dev: 1,
                        ino: 9,
                        mtime: 5,
                    },
                    false,
                    None,
                    1,
                )
                .unwrap(),
            StatStatus::Unchanged
        );
    }
}
