use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub const BUILD_OUTPUT_SPLITTER: &str = "build_output_splitter";
pub const SOURCE_DISASSEMBLY_SPLITTER: &str = "source_disassembly_splitter";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LayoutFile {
    #[serde(default)]
    splitters: BTreeMap<String, Vec<i32>>,
}

/// Splitter sizes keyed by name, read at view setup and written on resize.
#[derive(Debug, Clone, Default)]
pub struct LayoutStore {
    path: Option<PathBuf>,
    values: BTreeMap<String, Vec<i32>>,
}

impl LayoutStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A missing file yields an empty store bound to `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let values = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|e| {
                Error::msg(format!("failed to read layout {}: {e}", path.display()))
            })?;
            let file: LayoutFile = toml::from_str(&raw)?;
            file.splitters
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            values,
        })
    }

    pub fn get(&self, key: &str) -> Option<&[i32]> {
        self.values.get(key).map(Vec::as_slice)
    }

    /// Stores the sizes and writes the file through when the store is file-backed.
    pub fn set(&mut self, key: &str, sizes: Vec<i32>) -> Result<()> {
        if self.values.get(key) == Some(&sizes) {
            return Ok(());
        }
        self.values.insert(key.to_string(), sizes);
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = LayoutFile {
            splitters: self.values.clone(),
        };
        fs::write(path, toml::to_string_pretty(&file)?)?;
        debug!(path = %path.display(), "saved layout");
        Ok(())
    }
}
