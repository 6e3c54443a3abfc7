use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use filetime::FileTime;
use tracing::{debug, warn};

use crate::build_output::{ArtifactKind, BuildOutputStore, EntryOutput};
use crate::cli::kernel_list::{EntryLineRanges, entry_for_line};
use crate::error::Result;
use crate::isa_csv::IsaTable;
use crate::project::ProjectClone;

/// What the source and disassembly views should currently highlight.
/// An empty highlight means "show nothing".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Highlight {
    pub gpu: Option<String>,
    pub file: Option<PathBuf>,
    pub entry: Option<String>,
    pub source_line: Option<u32>,
    pub disassembly_rows: Vec<usize>,
}

impl Highlight {
    pub fn is_empty(&self) -> bool {
        self.source_line.is_none() && self.disassembly_rows.is_empty()
    }
}

/// Last modification time of `path`.
pub fn file_mtime(path: &Path) -> Result<DateTime<Utc>> {
    let meta = fs::metadata(path)?;
    let ft = FileTime::from_last_modification_time(&meta);
    Ok(DateTime::from_timestamp(ft.unix_seconds(), ft.nanoseconds()).unwrap_or_default())
}

/// Source line <-> disassembly row correlation for the active file and GPU.
#[derive(Debug, Default)]
pub struct CorrelationTracker {
    last_successful_build: Option<DateTime<Utc>>,
    active_gpu: Option<String>,
    active_file: Option<PathBuf>,
    selected_line: Option<u32>,
    highlight: Highlight,
    isa_cache: BTreeMap<PathBuf, IsaTable>,
    entry_ranges: BTreeMap<PathBuf, EntryLineRanges>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn highlight(&self) -> &Highlight {
        &self.highlight
    }

    pub fn active_gpu(&self) -> Option<&str> {
        self.active_gpu.as_deref()
    }

    pub fn active_file(&self) -> Option<&Path> {
        self.active_file.as_deref()
    }

    pub fn selected_line(&self) -> Option<u32> {
        self.selected_line
    }

    pub fn last_successful_build(&self) -> Option<DateTime<Utc>> {
        self.last_successful_build
    }

    pub fn is_line_correlation_enabled(&self, clone: &ProjectClone, file: &Path) -> bool {
        clone.source_file(file).is_some_and(|f| f.correlated)
    }

    /// Adopts the time of a build that finished in an earlier session. The
    /// persisted correlation flags are left as they are.
    pub fn restore_last_build(&mut self, finished_at: DateTime<Utc>) {
        self.last_successful_build = Some(finished_at);
        self.isa_cache.clear();
        self.entry_ranges.clear();
    }

    /// Drops cached tables and highlights; outputs are about to be replaced.
    pub fn on_build_started(&mut self) {
        self.isa_cache.clear();
        self.entry_ranges.clear();
        self.highlight = Highlight::default();
    }

    /// Every file that produced output becomes correlated again.
    pub fn on_build_succeeded(
        &mut self,
        clone: &mut ProjectClone,
        store: &BuildOutputStore,
        finished_at: DateTime<Utc>,
    ) {
        self.last_successful_build = Some(finished_at);
        self.isa_cache.clear();
        self.entry_ranges.clear();
        for file in &mut clone.source_files {
            if store.has_output_for_file(&file.path) {
                file.correlated = true;
            }
        }
        if let Some(gpu) = &self.active_gpu
            && store.gpu(gpu).is_none()
        {
            self.active_gpu = None;
        }
        self.refresh(clone, store);
    }

    /// A save newer than the last successful build makes the file's
    /// correlation data stale. Returns the resulting flag.
    pub fn on_source_file_saved(
        &mut self,
        clone: &mut ProjectClone,
        file: &Path,
        modified_at: DateTime<Utc>,
    ) -> bool {
        let stale = self
            .last_successful_build
            .is_none_or(|built| modified_at > built);
        let Some(info) = clone.source_file_mut(file) else {
            return false;
        };
        if stale {
            debug!(file = %file.display(), "source saved after last build");
            info.correlated = false;
            self.entry_ranges.remove(file);
            if self.active_file.as_deref() == Some(file) {
                self.highlight = Highlight::default();
            }
        }
        info.correlated
    }

    pub fn on_correlation_toggled(
        &mut self,
        clone: &mut ProjectClone,
        store: &BuildOutputStore,
        file: &Path,
        enabled: bool,
    ) {
        if let Some(info) = clone.source_file_mut(file) {
            info.correlated = enabled;
        }
        if self.active_file.as_deref() == Some(file) {
            self.refresh(clone, store);
        }
    }

    /// Entry point line ranges for a file, from the analyzer's kernel listing.
    pub fn set_entry_ranges(&mut self, file: &Path, ranges: EntryLineRanges) {
        self.entry_ranges.insert(file.to_path_buf(), ranges);
    }

    pub fn has_entry_ranges(&self, file: &Path) -> bool {
        self.entry_ranges.contains_key(file)
    }

    pub fn on_file_removed(&mut self, file: &Path) {
        self.entry_ranges.remove(file);
        if self.active_file.as_deref() == Some(file) {
            self.active_file = None;
            self.selected_line = None;
            self.highlight = Highlight::default();
        }
    }

    pub fn set_active_file(&mut self, file: &Path) {
        if self.active_file.as_deref() != Some(file) {
            self.active_file = Some(file.to_path_buf());
            self.selected_line = None;
            self.highlight = Highlight::default();
        }
    }

    /// Switches GPU and re-correlates the same selected line.
    pub fn set_active_gpu(&mut self, clone: &ProjectClone, store: &BuildOutputStore, gpu: &str) -> &Highlight {
        self.active_gpu = Some(gpu.to_string());
        self.refresh(clone, store);
        &self.highlight
    }

    pub fn select_source_line(
        &mut self,
        clone: &ProjectClone,
        store: &BuildOutputStore,
        file: &Path,
        line: u32,
    ) -> &Highlight {
        self.set_active_file(file);
        self.selected_line = Some(line);
        self.refresh(clone, store);
        &self.highlight
    }

    /// Highlights the source line behind a disassembly selection. Only a
    /// contiguous run of rows that all map to one source line qualifies.
    pub fn select_disassembly_rows(
        &mut self,
        clone: &ProjectClone,
        store: &BuildOutputStore,
        entry: &str,
        rows: &[usize],
    ) -> &Highlight {
        self.highlight = Highlight::default();
        let (Some(file), Some(gpu)) = (self.active_file.clone(), self.active_gpu.clone()) else {
            return &self.highlight;
        };
        if rows.is_empty() || !self.is_line_correlation_enabled(clone, &file) {
            return &self.highlight;
        }
        let mut sorted = rows.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.windows(2).any(|w| w[1] != w[0] + 1) {
            return &self.highlight;
        }

        let Some(entry_out) = store
            .file_outputs(&gpu, &file)
            .and_then(|f| f.entry(entry))
            .cloned()
        else {
            return &self.highlight;
        };
        let Some(table) = self.table_for(&entry_out) else {
            return &self.highlight;
        };
        let mut lines = sorted.iter().map(|r| table.source_line_for_row(*r));
        let Some(Some(first)) = lines.next() else {
            return &self.highlight;
        };
        if lines.all(|l| l == Some(first)) {
            self.highlight = Highlight {
                gpu: Some(gpu),
                file: Some(file),
                entry: Some(entry.to_string()),
                source_line: Some(first),
                disassembly_rows: sorted,
            };
        }
        &self.highlight
    }

    /// Recomputes the highlight from the current file, GPU and line.
    pub fn refresh(&mut self, clone: &ProjectClone, store: &BuildOutputStore) {
        self.highlight = Highlight::default();
        let (Some(file), Some(line)) = (self.active_file.clone(), self.selected_line) else {
            return;
        };
        if !self.is_line_correlation_enabled(clone, &file) {
            return;
        }
        if self.active_gpu.is_none() {
            self.active_gpu = store.gpus_for_file(&file).next().map(str::to_string);
        }
        let Some(gpu) = self.active_gpu.clone() else {
            return;
        };
        let Some(outputs) = store.file_outputs(&gpu, &file) else {
            return;
        };
        let Some(entry) = self.entry_for(&file, line, &outputs.entries) else {
            return;
        };
        let Some(table) = self.table_for(&entry) else {
            return;
        };
        let rows = table.rows_for_source_line(line).to_vec();
        if rows.is_empty() {
            return;
        }
        self.highlight = Highlight {
            gpu: Some(gpu),
            file: Some(file),
            entry: Some(entry.entry_name),
            source_line: Some(line),
            disassembly_rows: rows,
        };
    }

    fn entry_for(&mut self, file: &Path, line: u32, entries: &[EntryOutput]) -> Option<EntryOutput> {
        match entries {
            [] => None,
            [only] => Some(only.clone()),
            _ => {
                if let Some(name) = self
                    .entry_ranges
                    .get(file)
                    .and_then(|ranges| entry_for_line(ranges, line))
                {
                    return entries.iter().find(|e| e.entry_name == name).cloned();
                }
                entries
                    .iter()
                    .find(|e| {
                        self.table_for(e)
                            .is_some_and(|t| t.covers_source_line(line))
                    })
                    .cloned()
            }
        }
    }

    fn table_for(&mut self, entry: &EntryOutput) -> Option<&IsaTable> {
        let path = entry.artifact(ArtifactKind::IsaCsv)?.to_path_buf();
        if !self.isa_cache.contains_key(&path) {
            match IsaTable::load(&path) {
                Ok(table) => {
                    self.isa_cache.insert(path.clone(), table);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot load ISA table");
                    return None;
                }
            }
        }
        self.isa_cache.get(&path)
    }
}
