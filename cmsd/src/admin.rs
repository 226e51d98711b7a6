//! Sentinel files backing the admin overrides.
//!
//! The presence of `SUSPEND` or `NOSTAGE` in the admin directory means the
//! matching override is active. Administrators may create or remove the
//! files by hand, so presence is the only state ever persisted.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Suspend,
    NoStage,
}

impl Sentinel {
    pub fn file_name(&self) -> &'static str {
        match self {
            Sentinel::Suspend => "SUSPEND",
            Sentinel::NoStage => "NOSTAGE",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdminFiles {
    dir: Option<PathBuf>,
}

impl AdminFiles {
    pub fn new(dir: Option<PathBuf>) -> Self {
        AdminFiles { dir }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn path(&self, which: Sentinel) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(which.file_name()))
    }

    /// Whether the override is active on disk. Without an admin directory
    /// nothing is ever active.
    pub fn is_set(&self, which: Sentinel) -> bool {
        self.path(which).is_some_and(|path| path.exists())
    }

    /// Create (`active`) or remove the sentinel file. Both directions are
    /// idempotent.
    pub fn store(&self, which: Sentinel, active: bool) -> io::Result<()> {
        let Some(path) = self.path(which) else {
            return Ok(());
        };
        if active {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(false);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            options.open(&path).map(|_| ())
        } else {
            match std::fs::remove_file(&path) {
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        }
    }
}
