//! Output formatting for CLI commands.

use std::collections::BTreeMap;
use std::io::Write;

use serde::Serialize;

use crate::cli::args::OutputFormat;

/// One segment of a commit.
#[derive(Debug, Serialize)]
pub struct SegmentSummary {
    pub name: String,
    pub codec: String,
    pub max_doc: u32,
    pub deleted: u32,
    pub del_gen: u64,
    pub size_bytes: u64,
    pub source: Option<String>,
    pub timestamp: Option<String>,
}

/// One commit.
#[derive(Debug, Serialize)]
pub struct CommitSummary {
    pub generation: u64,
    pub file: String,
    pub index_id: String,
    pub num_docs: u64,
    pub max_doc: u64,
    pub segments: Vec<SegmentSummary>,
    pub user_data: BTreeMap<String, String>,
}

/// Result of `info`.
#[derive(Debug, Serialize)]
pub struct IndexInfo {
    pub path: String,
    pub latest: CommitSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub older_generations: Vec<u64>,
}

/// One file on storage.
#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size_bytes: u64,
    /// Generations of the commits that reference the file.
    pub referenced_by: Vec<u64>,
}

/// Result of `merge`.
#[derive(Debug, Serialize)]
pub struct MergeResult {
    pub segments_before: usize,
    pub segments_after: usize,
    pub generation: u64,
    pub duration_ms: u64,
}

/// Result of `purge`.
#[derive(Debug, Serialize)]
pub struct PurgeResult {
    pub deleted: Vec<String>,
}

/// Something the CLI can print.
pub trait Render: Serialize {
    fn render_human(&self, out: &mut dyn Write) -> std::io::Result<()>;
}

/// Print `value` to stdout in the requested format.
pub fn emit<T: Render>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputFormat::Human => value.render_human(&mut out)?,
    }
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

impl Render for IndexInfo {
    fn render_human(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let latest = &self.latest;
        writeln!(out, "Index:      {}", self.path)?;
        writeln!(out, "Index id:   {}", latest.index_id)?;
        writeln!(out, "Generation: {} ({})", latest.generation, latest.file)?;
        writeln!(out, "Documents:  {} live / {} total", latest.num_docs, latest.max_doc)?;
        writeln!(out, "Segments:   {}", latest.segments.len())?;
        for segment in &latest.segments {
            writeln!(
                out,
                "  {:<8} {:<6} docs={:<8} deleted={:<6} del_gen={:<3} size={:<10} source={}",
                segment.name,
                segment.codec,
                segment.max_doc,
                segment.deleted,
                segment.del_gen,
                human_size(segment.size_bytes),
                segment.source.as_deref().unwrap_or("-"),
            )?;
        }
        if !latest.user_data.is_empty() {
            writeln!(out, "User data:")?;
            for (key, value) in &latest.user_data {
                writeln!(out, "  {key} = {value}")?;
            }
        }
        if !self.older_generations.is_empty() {
            let generations: Vec<String> =
                self.older_generations.iter().map(u64::to_string).collect();
            writeln!(out, "Older commits: {}", generations.join(", "))?;
        }
        Ok(())
    }
}

impl Render for Vec<FileEntry> {
    fn render_human(&self, out: &mut dyn Write) -> std::io::Result<()> {
        for file in self {
            let refs = if file.referenced_by.is_empty() {
                "unreferenced".to_string()
            } else {
                let generations: Vec<String> =
                    file.referenced_by.iter().map(u64::to_string).collect();
                format!("gen {}", generations.join(","))
            };
            writeln!(out, "{:<28} {:>10}  {}", file.name, human_size(file.size_bytes), refs)?;
        }
        Ok(())
    }
}

impl Render for MergeResult {
    fn render_human(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            out,
            "Merged {} segment(s) into {} in {} ms (generation {})",
            self.segments_before, self.segments_after, self.duration_ms, self.generation
        )
    }
}

impl Render for PurgeResult {
    fn render_human(&self, out: &mut dyn Write) -> std::io::Result<()> {
        if self.deleted.is_empty() {
            return writeln!(out, "Nothing to delete");
        }
        for name in &self.deleted {
            writeln!(out, "deleted {name}")?;
        }
        writeln!(out, "{} file(s) deleted", self.deleted.len())
    }
}
