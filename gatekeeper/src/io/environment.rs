//! Probing the host for tools and paths referenced by an operation.

use std::env;
use std::path::{Path, PathBuf};

pub trait Environment: Send + Sync {
    /// Resolve a tool name (or explicit path) to an executable location.
    fn resolve_tool(&self, name: &str) -> Option<PathBuf>;
    fn path_exists(&self, path: &Path) -> bool;
}

/// The real host, resolving tools through `PATH`.
#[derive(Debug, Clone)]
pub struct SystemEnvironment {
    search_path: Vec<PathBuf>,
}

impl SystemEnvironment {
    pub fn from_env() -> Self {
        let search_path = env::var_os("PATH")
            .map(|raw| env::split_paths(&raw).collect())
            .unwrap_or_default();
        Self { search_path }
    }

    pub fn with_search_path(search_path: Vec<PathBuf>) -> Self {
        Self { search_path }
    }
}

impl Environment for SystemEnvironment {
    fn resolve_tool(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() {
            return None;
        }
        if name.contains('/') {
            let path = PathBuf::from(name);
            return path.is_file().then_some(path);
        }
        self.search_path
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
