//! Per-label BO accounting.
//!
//! Purely observational: collecting or printing a report never changes
//! allocator state.

use std::collections::BTreeMap;
use std::io::{self, Write};

use super::Bo;
use super::table::BoTable;

/// Aggregate usage for one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelStat {
    pub label: String,
    pub count: u32,
    pub alloc_bytes: usize,
    pub mapped_bytes: usize,
}

impl LabelStat {
    fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            count: 0,
            alloc_bytes: 0,
            mapped_bytes: 0,
        }
    }

    fn account(&mut self, bo: &Bo) {
        self.count += 1;
        self.alloc_bytes += bo.size();
        if bo.is_mapped() {
            self.mapped_bytes += bo.size();
        }
    }

    fn write_line(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(out, "{}: {}", self.label, format_size(self.alloc_bytes))?;
        if self.mapped_bytes != 0 {
            write!(out, ", mapped {}", format_size(self.mapped_bytes))?;
        }
        writeln!(out, ", {} BOs", self.count)
    }
}

/// One live BO in a verbose report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleLine {
    pub handle: u32,
    pub label: String,
    pub size: usize,
}

/// Snapshot of every live BO, grouped by label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoReport {
    /// Labels by descending allocated bytes.
    pub labels: Vec<LabelStat>,
    pub total: LabelStat,
    /// Every live BO in handle order.
    pub handles: Vec<HandleLine>,
}

impl BoReport {
    pub(crate) fn collect(table: &BoTable) -> Self {
        let mut total = LabelStat::new("Total");
        let mut by_label: BTreeMap<String, LabelStat> = BTreeMap::new();
        let mut handles = Vec::with_capacity(table.len());

        for bo in table.iter() {
            let label = bo.label();
            debug_assert!(!label.is_empty(), "BO {} has no label", bo.handle());

            handles.push(HandleLine {
                handle: bo.handle(),
                label: label.to_string(),
                size: bo.size(),
            });
            total.account(bo);
            by_label
                .entry(label.into_owned())
                .or_insert_with_key(|label| LabelStat::new(label.as_str()))
                .account(bo);
        }

        let mut labels: Vec<LabelStat> = by_label.into_values().collect();
        // Stable sort keeps equal sizes in label order.
        labels.sort_by(|a, b| b.alloc_bytes.cmp(&a.alloc_bytes));

        Self {
            labels,
            total,
            handles,
        }
    }

    /// Write the human-readable report.
    pub fn write_to(&self, out: &mut dyn Write, verbose: bool) -> io::Result<()> {
        if verbose {
            writeln!(out, "---")?;
            for line in &self.handles {
                writeln!(
                    out,
                    "{}: {} {} KiB",
                    line.handle,
                    line.label,
                    line.size / 1024
                )?;
            }
            writeln!(out)?;
        }

        for stat in &self.labels {
            stat.write_line(out)?;
        }
        self.total.write_line(out)?;

        if verbose {
            writeln!(out, "---")?;
        }
        writeln!(out)
    }
}

/// Human-readable byte count: `B`, `KiB` (rounded up), or one-decimal `MiB`/`GiB`.
#[must_use]
pub fn format_size(bytes: usize) -> String {
    const KIB: usize = 1024;
    const MIB: usize = 1024 * KIB;
    const GIB: usize = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{} KiB", bytes.div_ceil(KIB))
    } else {
        format!("{bytes} B")
    }
}
