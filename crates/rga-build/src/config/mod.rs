pub mod layout;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;
use tracing::debug;

use crate::error::{Error, Result};

fn default_executable() -> String {
    "rga".into()
}

fn default_session_metadata_filename() -> String {
    "cliInvocation.xml".into()
}

fn default_binary_name() -> String {
    "codeobj.bin".into()
}

fn default_spv_text_extensions() -> Vec<String> {
    vec!["txt".into()]
}

fn default_output_dir_name() -> String {
    "Output".into()
}

fn default_clone_dir_prefix() -> String {
    "Clone".into()
}

/// Settings shared by the command-line builder, the orchestrator and the
/// correlation tracker. Built once and handed out as `Arc<AnalyzerConfig>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Passed to the analyzer as `--log` when set.
    pub cli_log_file: Option<PathBuf>,
    #[serde(default = "default_session_metadata_filename")]
    pub session_metadata_filename: String,
    #[serde(default = "default_binary_name")]
    pub default_binary_name: String,
    /// Extensions (without the dot) of SPIR-V assembly text inputs.
    #[serde(default = "default_spv_text_extensions")]
    pub spv_text_extensions: Vec<String>,
    #[serde(default = "default_output_dir_name")]
    pub output_dir_name: String,
    #[serde(default = "default_clone_dir_prefix")]
    pub clone_dir_prefix: String,
    pub layout_file: Option<PathBuf>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            cli_log_file: None,
            session_metadata_filename: default_session_metadata_filename(),
            default_binary_name: default_binary_name(),
            spv_text_extensions: default_spv_text_extensions(),
            output_dir_name: default_output_dir_name(),
            clone_dir_prefix: default_clone_dir_prefix(),
            layout_file: None,
        }
    }
}

impl AnalyzerConfig {
    pub fn is_spv_text(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.spv_text_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    pub fn binary_name<'a>(&'a self, configured: &'a str) -> &'a str {
        let configured = configured.trim();
        if configured.is_empty() {
            &self.default_binary_name
        } else {
            configured
        }
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::parse(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::parse(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base_path = resolve_ref_path(path, ext);
        debug!(config = %path.display(), base = %base_path.display(), "config extends");
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

/// Read a config file and its `extends` chain, child keys winning.
pub fn load_value(path: &Path) -> Result<Value> {
    let mut stack = HashSet::<PathBuf>::new();
    load_value_inner(path, &mut stack)
}

pub fn load(path: &Path) -> Result<AnalyzerConfig> {
    let value = load_value(path)?;
    value
        .try_into()
        .map_err(|e| Error::parse(format!("invalid config {}: {e}", path.display())))
}
