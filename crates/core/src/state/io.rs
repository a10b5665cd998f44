//! # IO Utilities
//!
//! Workspace-scoped locations for the `.foreman` runtime directory, plus the
//! path-safety checks used wherever a caller-supplied relative path is
//! joined onto a root.

use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};

use crate::error::ForemanError;

/// Runtime directory name inside a workspace
pub const RUNTIME_DIR: &str = ".foreman";

/// Environment override for the runtime directory
pub const RUNTIME_PATH_ENV: &str = "FOREMAN_RUNTIME_PATH";

/// Durable mode state document
pub const MODE_STATE_FILE: &str = "mode-state.json";

/// Embedded database
pub const DB_FILE: &str = "foreman.db";

/// Resolved locations for one workspace
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    workspace: PathBuf,
    runtime_dir: PathBuf,
}

impl RuntimePaths {
    /// Runtime directory at `<workspace>/.foreman`
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        let runtime_dir = workspace.join(RUNTIME_DIR);
        Self {
            workspace,
            runtime_dir,
        }
    }

    /// Like `new`, but honors `FOREMAN_RUNTIME_PATH` when set
    pub fn from_env(workspace: impl Into<PathBuf>) -> Self {
        let mut paths = Self::new(workspace);
        if let Ok(path) = std::env::var(RUNTIME_PATH_ENV) {
            if !path.trim().is_empty() {
                paths.runtime_dir = PathBuf::from(path);
            }
        }
        paths
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn mode_state_path(&self) -> PathBuf {
        self.runtime_dir.join(MODE_STATE_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.runtime_dir.join(DB_FILE)
    }

    /// Ensure the runtime directory exists
    pub fn ensure_runtime_dir(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.runtime_dir).with_context(|| {
            format!("Failed to create runtime directory: {:?}", self.runtime_dir)
        })?;
        Ok(self.runtime_dir.clone())
    }

    /// Resolve a relative path inside the runtime directory
    pub fn runtime_file(&self, relative: &str) -> Result<PathBuf, ForemanError> {
        resolve_within(&self.runtime_dir, relative)
    }
}

/// Normalize separators: `\` becomes `/`, leading `./` and repeated `/` go away.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    let absolute = unified.starts_with('/');
    for part in unified.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        parts.push(part);
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Join `relative` onto `root`, rejecting anything that could land outside it.
///
/// Absolute paths, drive prefixes, and `..` segments that climb above the
/// root are errors. The path is never rewritten into a different one.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, ForemanError> {
    let unsafe_path = |reason: &str| ForemanError::UnsafePath {
        path: relative.to_string(),
        reason: reason.to_string(),
    };

    if relative.trim().is_empty() {
        return Err(unsafe_path("empty path"));
    }

    let unified = relative.replace('\\', "/");
    let candidate = Path::new(&unified);
    if candidate.is_absolute() || unified.starts_with('/') {
        return Err(unsafe_path("absolute paths are not allowed"));
    }

    let mut depth: usize = 0;
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => {
                // Windows drive letters survive as a normal component on unix
                if part.to_string_lossy().contains(':') {
                    return Err(unsafe_path("drive prefixes are not allowed"));
                }
                depth += 1;
                clean.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(unsafe_path("path escapes its root"));
                }
                depth -= 1;
                clean.pop();
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path("absolute paths are not allowed"));
            }
        }
    }

    if depth == 0 {
        return Err(unsafe_path("path resolves to the root itself"));
    }

    let joined = root.join(&clean);

    // Symlinked ancestors can still point outside the root
    if let (Ok(real_root), Some(existing)) = (root.canonicalize(), deepest_existing(&joined)) {
        if let Ok(real) = existing.canonicalize() {
            if !real.starts_with(&real_root) {
                return Err(unsafe_path("path resolves outside its root via a symlink"));
            }
        }
    }

    Ok(joined)
}

fn deepest_existing(path: &Path) -> Option<&Path> {
    let mut current = Some(path);
    while let Some(p) = current {
        if p.exists() {
            return Some(p);
        }
        current = p.parent();
    }
    None
}
