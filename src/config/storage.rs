//! Named storage roots for checkpoint discovery.
//!
//! Each root maps a category name (`diffusion_models`, `text_encoders`, ...)
//! to one or more directories and the file suffixes accepted from them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Suffixes accepted by the default roots
const CHECKPOINT_SUFFIXES: [&str; 3] = [".safetensors", ".sft", ".gguf"];

/// One named root
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageRoot {
    /// Directories searched in order
    pub paths: Vec<PathBuf>,
    /// Accepted suffixes including the dot; empty accepts everything
    #[serde(default)]
    pub suffixes: Vec<String>,
}

impl StorageRoot {
    pub fn new(paths: Vec<PathBuf>, suffixes: &[&str]) -> Self {
        Self {
            paths,
            suffixes: suffixes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn accepts(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        self.suffixes.is_empty()
            || self
                .suffixes
                .iter()
                .any(|suffix| lower.ends_with(&suffix.to_lowercase()))
    }
}

/// Storage roots by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub roots: BTreeMap<String, StorageRoot>,
}

impl StorageConfig {
    /// Default roots under `base_dir`.
    ///
    /// `diffusion_models` also searches the legacy `unet` folder, and
    /// `text_encoders` the legacy `clip` folder.
    pub fn with_base_dir(base_dir: impl AsRef<Path>) -> Self {
        let base = base_dir.as_ref();
        let mut config = Self::default();
        config.add_root(
            "diffusion_models",
            StorageRoot::new(
                vec![base.join("diffusion_models"), base.join("unet")],
                &CHECKPOINT_SUFFIXES,
            ),
        );
        config.add_root(
            "text_encoders",
            StorageRoot::new(
                vec![base.join("text_encoders"), base.join("clip")],
                &CHECKPOINT_SUFFIXES,
            ),
        );
        config
    }

    /// Load roots from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StorageConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Register a root, replacing any existing one with the same name
    pub fn add_root(&mut self, name: impl Into<String>, root: StorageRoot) {
        let name = name.into();
        if let Some(previous) = self.roots.get(&name) {
            if previous.paths != root.paths {
                tracing::warn!(
                    "Storage root '{}' replaced: {:?} -> {:?}",
                    name,
                    previous.paths,
                    root.paths
                );
            }
        }
        self.roots.insert(name, root);
    }

    pub fn root(&self, name: &str) -> crate::Result<&StorageRoot> {
        self.roots
            .get(name)
            .ok_or_else(|| crate::QuantPatchError::Config(format!("Unknown storage root '{}'", name)))
    }

    /// Accepted files under a root, relative to their directory, sorted and
    /// deduplicated across directories
    pub fn list(&self, name: &str) -> crate::Result<Vec<String>> {
        let root = self.root(name)?;
        let mut files = BTreeSet::new();

        for dir in &root.paths {
            if !dir.is_dir() {
                tracing::debug!("Skipping missing storage directory {:?}", dir);
                continue;
            }
            collect_files(dir, dir, root, &mut files)?;
        }

        Ok(files.into_iter().collect())
    }

    /// Full path of `file_name` under a root; the first directory holding it wins
    pub fn resolve(&self, name: &str, file_name: &str) -> crate::Result<PathBuf> {
        let root = self.root(name)?;
        let relative = Path::new(file_name);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(crate::QuantPatchError::Config(format!(
                "'{}' escapes storage root '{}'",
                file_name, name
            )));
        }

        root.paths
            .iter()
            .map(|dir| dir.join(relative))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                crate::QuantPatchError::Config(format!(
                    "'{}' not found under storage root '{}'",
                    file_name, name
                ))
            })
    }
}

fn collect_files(
    base: &Path,
    dir: &Path,
    root: &StorageRoot,
    files: &mut BTreeSet<String>,
) -> crate::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(base, &path, root, files)?;
            continue;
        }

        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        if root.accepts(&relative) {
            files.insert(relative);
        }
    }
    Ok(())
}
