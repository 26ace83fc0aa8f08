//! Command implementations for the xiphos CLI.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;

use crate::cli::args::{Command, DumpArgs, InfoArgs, MergeArgs, XiphosArgs};
use crate::cli::output::{
    CommitSummary, FileEntry, IndexInfo, MergeResult, PurgeResult, SegmentSummary, emit,
};
use crate::codec::text::PlainTextCodec;
use crate::codec::{Codec, CodecRegistry};
use crate::index::commit::CommitPoint;
use crate::index::config::{IndexWriterConfig, OpenMode};
use crate::index::directory::Directory;
use crate::index::segment_reader::SegmentCore;
use crate::index::writer::IndexWriter;
use crate::storage::file::FileStorageConfig;
use crate::storage::memory::MemoryStorage;
use crate::storage::{Storage, StorageConfig};

/// Execute a CLI command.
pub fn execute_command(args: XiphosArgs) -> Result<()> {
    let path = args
        .index
        .clone()
        .ok_or_else(|| anyhow!("no index given; pass --index or set XIPHOS_INDEX"))?;
    let directory = open_directory(&path)?;

    match &args.command {
        Command::Info(info_args) => show_info(&directory, &path, info_args, &args),
        Command::Files => list_files(&directory, &args),
        Command::Dump(dump_args) => dump_segments(&directory, dump_args),
        Command::Merge(merge_args) => merge_index(directory, merge_args, &args),
        Command::Purge => purge_index(directory, &args),
    }
}

fn open_directory(path: &Path) -> Result<Directory> {
    if !path.is_dir() {
        bail!("index directory does not exist: {}", path.display());
    }
    Directory::open(StorageConfig::File(FileStorageConfig::new(path)))
        .with_context(|| format!("failed to open {}", path.display()))
}

fn latest_commit(directory: &Directory) -> Result<CommitPoint> {
    CommitPoint::read_latest(directory.storage())?
        .ok_or_else(|| anyhow!("no commit found in index"))
}

fn summarize(directory: &Directory, commit: &CommitPoint) -> CommitSummary {
    let segments = commit
        .segments
        .iter()
        .map(|sci| SegmentSummary {
            name: sci.info.name.clone(),
            codec: sci.info.codec.clone(),
            max_doc: sci.info.doc_count,
            deleted: sci.del_count,
            del_gen: sci.del_gen,
            size_bytes: directory.size_of(&sci.files()),
            source: sci.info.diagnostics.get("source").cloned(),
            timestamp: sci.info.diagnostics.get("timestamp").cloned(),
        })
        .collect();
    CommitSummary {
        generation: commit.generation,
        file: commit.file_name(),
        index_id: commit.index_id.to_string(),
        num_docs: commit.num_docs(),
        max_doc: commit.max_doc(),
        segments,
        user_data: commit.user_data.clone(),
    }
}

fn show_info(directory: &Directory, path: &Path, args: &InfoArgs, cli: &XiphosArgs) -> Result<()> {
    let latest = latest_commit(directory)?;
    let older_generations = if args.all_commits {
        CommitPoint::list_commits(directory.storage())?
            .iter()
            .map(|commit| commit.generation)
            .filter(|generation| *generation != latest.generation)
            .collect()
    } else {
        Vec::new()
    };
    let info = IndexInfo {
        path: path.display().to_string(),
        latest: summarize(directory, &latest),
        older_generations,
    };
    emit(&info, cli.output_format)
}

fn list_files(directory: &Directory, cli: &XiphosArgs) -> Result<()> {
    let storage = directory.storage();
    let mut references: HashMap<String, Vec<u64>> = HashMap::new();
    for commit in CommitPoint::list_commits(storage)? {
        for file in commit.files() {
            references.entry(file).or_default().push(commit.generation);
        }
    }

    let files: Vec<FileEntry> = storage
        .list_files()?
        .into_iter()
        .map(|name| {
            let mut referenced_by = references.remove(&name).unwrap_or_default();
            referenced_by.sort_unstable();
            FileEntry {
                size_bytes: storage.file_size(&name).unwrap_or(0),
                name,
                referenced_by,
            }
        })
        .collect();
    emit(&files, cli.output_format)
}

/// Re-encode segments with the plain-text codec in memory and print them.
fn dump_segments(directory: &Directory, args: &DumpArgs) -> Result<()> {
    let commit = latest_commit(directory)?;
    let codecs = CodecRegistry::default();
    let text = PlainTextCodec;
    let scratch = MemoryStorage::new_default();

    let mut dumped = 0;
    for sci in &commit.segments {
        if args.segment.as_deref().is_some_and(|name| name != sci.info.name) {
            continue;
        }
        let core = SegmentCore::open(directory, sci.info.clone(), &codecs);
        let name = core.name();
        let files = [
            text.write_postings(&scratch, name, &*core.postings()?)?,
            text.write_doc_values(&scratch, name, &*core.doc_values()?)?,
            text.write_stored_fields(&scratch, name, &*core.stored_fields()?)?,
        ];
        println!("=== segment {name} ({} docs, codec {}) ===", sci.info.doc_count, sci.info.codec);
        if let Some(live) = sci.live_docs_file() {
            println!("live docs: {live} ({} deleted)", sci.del_count);
        }
        for file in files {
            let mut input = scratch.open_input(&file)?;
            let mut content = String::new();
            input.read_to_string(&mut content)?;
            println!("--- {file}");
            print!("{content}");
        }
        dumped += 1;
    }

    if let Some(segment) = &args.segment {
        if dumped == 0 {
            bail!("segment {segment} is not part of generation {}", commit.generation);
        }
    }
    Ok(())
}

fn open_writer(directory: Directory) -> Result<IndexWriter> {
    let config = IndexWriterConfig::default().with_open_mode(OpenMode::Append);
    IndexWriter::open(directory, config).context("failed to open index writer")
}

fn merge_index(directory: Directory, args: &MergeArgs, cli: &XiphosArgs) -> Result<()> {
    let writer = open_writer(directory)?;
    let segments_before = writer.segment_count();
    let start = Instant::now();

    writer.force_merge(args.max_segments)?;
    writer.close()?;

    let result = MergeResult {
        segments_before,
        segments_after: writer.segment_count(),
        generation: writer.generation(),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    info!(
        before = result.segments_before,
        after = result.segments_after,
        "merge command finished"
    );
    emit(&result, cli.output_format)
}

fn purge_index(directory: Directory, cli: &XiphosArgs) -> Result<()> {
    let writer = open_writer(directory)?;
    let deleted = writer.delete_unused_files()?;
    writer.close()?;
    emit(&PurgeResult { deleted }, cli.output_format)
}
