//! A text file loaded as an ordered sequence of lines, saved back through an
//! atomic replace that preserves the file's line-ending mode.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{EditError, EditResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

#[derive(Debug)]
pub struct EditFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
    line_ending: LineEnding,
    trailing_newline: bool,
    original: String,
}

impl EditFile {
    /// Load a file; a missing file starts as an empty sequence.
    pub fn load<P: AsRef<Path>>(path: P) -> EditResult<Self> {
        let path = path.as_ref().to_path_buf();
        let original = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(EditError::Io { path: path.display().to_string(), source: e }),
        };
        Ok(Self::from_content(path, original))
    }

    pub fn from_content(path: PathBuf, original: String) -> Self {
        let line_ending = if original.contains("\r\n") {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        };
        let trailing_newline = original.is_empty() || original.ends_with('\n');
        let lines = if original.is_empty() {
            Vec::new()
        } else {
            original
                .trim_end_matches('\n')
                .split('\n')
                .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
                .collect()
        };
        Self {
            path,
            lines,
            line_ending,
            trailing_newline,
            original,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    /// Serialize the current line sequence in the file's ending mode.
    pub fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let separator = match self.line_ending {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        };
        let mut out = self.lines.join(separator);
        if self.trailing_newline {
            out.push_str(separator);
        }
        out
    }

    pub fn modified(&self) -> bool {
        self.render() != self.original
    }

    /// Write back if the sequence changed. Returns whether a change was
    /// (or, in dry-run, would have been) saved. The write goes through a
    /// temporary file in the same directory, fsync, then rename.
    pub fn save(&mut self, dry_run: bool) -> EditResult<bool> {
        let rendered = self.render();
        if rendered == self.original {
            debug!(file = %self.path.display(), "no edit changes to save");
            return Ok(false);
        }
        if dry_run {
            info!(file = %self.path.display(), "dry-run: would save edited file");
            return Ok(true);
        }

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let io_err = |e: std::io::Error| EditError::Io {
            path: self.path.display().to_string(),
            source: e,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(io_err)?;
        tmp.write_all(rendered.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path)
            .map_err(|e| io_err(e.error))?;

        info!(file = %self.path.display(), "saved edited file");
        self.original = rendered;
        Ok(true)
    }
}
