use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::cli::command::CommandLineBuilder;
use crate::cli::invoker::ProcessInvoker;
use crate::error::{Error, Result};
use crate::project::ProjectApi;

/// Entry point name to the source lines it spans.
pub type EntryLineRanges = BTreeMap<String, RangeInclusive<u32>>;

fn entry_line_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?P<name>[^:\s][^:]*?)\s*:\s*(?P<start>\d+)\s*-\s*(?P<end>\d+)\s*$").ok()
    })
    .as_ref()
}

/// Parses `--list-kernels` output: one `name: start-end` line per entry.
/// Lines that do not match are ignored.
pub fn parse_list_kernels(output: &str) -> EntryLineRanges {
    let mut out = EntryLineRanges::new();
    let Some(re) = entry_line_re() else {
        return out;
    };
    for line in output.lines() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let (Ok(start), Ok(end)) = (caps["start"].parse::<u32>(), caps["end"].parse::<u32>())
        else {
            continue;
        };
        let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
        out.insert(caps["name"].to_string(), lo..=hi);
    }
    out
}

/// Name of the entry whose range contains `line`, preferring the narrowest match.
pub fn entry_for_line(ranges: &EntryLineRanges, line: u32) -> Option<&str> {
    ranges
        .iter()
        .filter(|(_, r)| r.contains(&line))
        .min_by_key(|(_, r)| r.end() - r.start())
        .map(|(name, _)| name.as_str())
}

/// Runs the analyzer in listing mode for one source file.
pub fn list_kernels(
    builder: &CommandLineBuilder<'_>,
    invoker: &dyn ProcessInvoker,
    api: ProjectApi,
    source: &Path,
) -> Result<EntryLineRanges> {
    let cmd = builder.list_kernels(api, source);
    let inv = invoker.invoke(&cmd)?;
    if !inv.success {
        return Err(Error::msg(format!(
            "listing entries of {} failed: {}",
            source.display(),
            inv.output.trim()
        )));
    }
    let ranges = parse_list_kernels(&inv.output);
    if ranges.is_empty() {
        return Err(Error::parse(format!(
            "no entries found in {}",
            source.display()
        )));
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_and_skips_noise() {
        let out = "Warning: something\nadd: 3-10\n mul_matrix : 12 - 40\n\n";
        let ranges = parse_list_kernels(out);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges["add"], 3..=10);
        assert_eq!(ranges["mul_matrix"], 12..=40);
    }

    #[test]
    fn narrowest_range_wins() {
        let mut ranges = EntryLineRanges::new();
        ranges.insert("outer".into(), 1..=100);
        ranges.insert("inner".into(), 20..=30);
        assert_eq!(entry_for_line(&ranges, 25), Some("inner"));
        assert_eq!(entry_for_line(&ranges, 50), Some("outer"));
        assert_eq!(entry_for_line(&ranges, 101), None);
    }
}
