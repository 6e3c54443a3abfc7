use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

const INSTRUCTION_COLUMNS: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: String,
    pub opcode: String,
    pub operands: String,
    pub functional_unit: String,
    pub cycles: String,
    pub binary_encoding: String,
    /// 1-based source line, `None` when the instruction has no source mapping.
    pub source_line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsaRow {
    Label(String),
    Instruction(Instruction),
}

/// One parsed `CSV_ISA` file. Row indices count data rows only (the header is dropped).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsaTable {
    pub rows: Vec<IsaRow>,
    source_to_rows: BTreeMap<u32, Vec<usize>>,
    row_to_source: BTreeMap<usize, u32>,
}

impl IsaTable {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::msg(format!("failed to read ISA {}: {e}", path.display())))?;
        Self::parse(&text).map_err(|e| Error::parse(format!("{}: {e}", path.display())))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut table = IsaTable::default();
        for (line_no, line) in text.lines().enumerate().skip(1) {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let fields = split_csv_line(line);
            let row = match fields.len() {
                1 => IsaRow::Label(fields[0].trim().to_string()),
                INSTRUCTION_COLUMNS => {
                    let source_line = fields[1]
                        .trim()
                        .parse::<i64>()
                        .ok()
                        .filter(|n| *n > 0)
                        .and_then(|n| u32::try_from(n).ok());
                    IsaRow::Instruction(Instruction {
                        address: fields[0].trim().to_string(),
                        opcode: fields[2].trim().to_string(),
                        operands: fields[3].trim().to_string(),
                        functional_unit: fields[4].trim().to_string(),
                        cycles: fields[5].trim().to_string(),
                        binary_encoding: fields[6].trim().to_string(),
                        source_line,
                    })
                }
                n => {
                    return Err(Error::parse(format!(
                        "line {}: expected 1 or {INSTRUCTION_COLUMNS} columns, found {n}",
                        line_no + 1
                    )));
                }
            };
            let row_idx = table.rows.len();
            if let IsaRow::Instruction(Instruction {
                source_line: Some(src),
                ..
            }) = &row
            {
                table.source_to_rows.entry(*src).or_default().push(row_idx);
                table.row_to_source.insert(row_idx, *src);
            }
            table.rows.push(row);
        }
        Ok(table)
    }

    /// Rows generated from `source_line`, in file order.
    pub fn rows_for_source_line(&self, source_line: u32) -> &[usize] {
        self.source_to_rows
            .get(&source_line)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn source_line_for_row(&self, row: usize) -> Option<u32> {
        self.row_to_source.get(&row).copied()
    }

    /// Lowest and highest source line this entry covers.
    pub fn source_line_span(&self) -> Option<(u32, u32)> {
        let lo = *self.source_to_rows.keys().next()?;
        let hi = *self.source_to_rows.keys().next_back()?;
        Some((lo, hi))
    }

    pub fn covers_source_line(&self, line: u32) -> bool {
        self.source_line_span()
            .is_some_and(|(lo, hi)| (lo..=hi).contains(&line))
    }
}

/// Splits on commas outside double quotes; quotes are dropped from the fields.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut cur)),
            c => cur.push(c),
        }
    }
    fields.push(cur);
    fields
}
