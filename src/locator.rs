//! Locating service binaries on disk
//!
//! Search order: configured search directories, project-relative locations
//! (`./bin`, `.`), well-known install directories, then every `PATH` entry.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Well-known install locations checked after project-relative ones
const SYSTEM_DIRS: &[&str] = &["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin"];

/// No candidate location held an executable file
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("binary '{name}' not found in: {}", display_paths(.searched))]
pub struct NotFound {
    pub name: String,
    pub searched: Vec<PathBuf>,
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Ordered set of directories searched for a binary
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    project_dirs: Vec<PathBuf>,
    system_dirs: Vec<PathBuf>,
    path_var: Option<OsString>,
}

impl BinaryLocator {
    /// Locator using the working directory, the standard install
    /// directories and the process `PATH`
    pub fn new(search_dirs: &[PathBuf]) -> Self {
        let mut project_dirs: Vec<PathBuf> = search_dirs.to_vec();
        project_dirs.push(PathBuf::from("bin"));
        project_dirs.push(PathBuf::from("."));

        let mut system_dirs: Vec<PathBuf> = SYSTEM_DIRS.iter().map(PathBuf::from).collect();
        if let Some(home) = dirs_next::home_dir() {
            system_dirs.push(home.join(".local").join("bin"));
        }

        Self {
            project_dirs,
            system_dirs,
            path_var: std::env::var_os("PATH"),
        }
    }

    /// Locator with explicit directories, for callers that must not read the environment
    pub fn with_dirs(
        project_dirs: Vec<PathBuf>,
        system_dirs: Vec<PathBuf>,
        path_var: Option<OsString>,
    ) -> Self {
        Self {
            project_dirs,
            system_dirs,
            path_var,
        }
    }

    /// Every path examined for `name`, in search order, without duplicates
    pub fn candidates(&self, name: &str) -> Vec<PathBuf> {
        if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
            return vec![absolute(Path::new(name))];
        }

        let path_dirs = self
            .path_var
            .as_ref()
            .map(|p| std::env::split_paths(p).collect::<Vec<_>>())
            .unwrap_or_default();

        let mut candidates: Vec<PathBuf> = Vec::new();
        for dir in self
            .project_dirs
            .iter()
            .chain(self.system_dirs.iter())
            .chain(path_dirs.iter())
        {
            if dir.as_os_str().is_empty() {
                continue;
            }
            let candidate = absolute(&dir.join(name));
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        candidates
    }

    /// Find the first candidate that is an executable regular file
    pub fn locate(&self, name: &str) -> Result<PathBuf, NotFound> {
        let candidates = self.candidates(name);

        for candidate in &candidates {
            if is_executable_file(candidate) {
                debug!(binary = name, path = %candidate.display(), "Located binary");
                return Ok(candidate.clone());
            }
        }

        Err(NotFound {
            name: name.to_string(),
            searched: candidates,
        })
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Exists, is not a directory, and has at least one execute bit set
pub fn is_executable_file(path: &Path) -> bool {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return false,
    };
    if metadata.is_dir() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        metadata.is_file()
    }
}
