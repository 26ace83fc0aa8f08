//! Command line argument parsing for the xiphos CLI using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// xiphos - inspect and maintain a segment-based index
#[derive(Parser, Debug, Clone)]
#[command(name = "xiphos")]
#[command(about = "Inspect and maintain a xiphos index")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct XiphosArgs {
    /// Index directory
    #[arg(short, long, value_name = "INDEX_PATH", env = "XIPHOS_INDEX", global = true)]
    pub index: Option<PathBuf>,

    /// Log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human", global = true)]
    pub output_format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl XiphosArgs {
    /// Default log filter for the verbosity flags.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the latest commit and its segments
    Info(InfoArgs),

    /// List index files and what references them
    Files,

    /// Print segment data in the plain-text codec format
    Dump(DumpArgs),

    /// Force-merge the index down to a number of segments
    Merge(MergeArgs),

    /// Delete files no commit references
    Purge,
}

/// Arguments for `info`
#[derive(Parser, Debug, Clone)]
pub struct InfoArgs {
    /// Also list every readable commit, not only the latest
    #[arg(long)]
    pub all_commits: bool,
}

/// Arguments for `dump`
#[derive(Parser, Debug, Clone)]
pub struct DumpArgs {
    /// Only dump this segment (e.g. `_3`)
    #[arg(short, long, value_name = "SEGMENT")]
    pub segment: Option<String>,
}

/// Arguments for `merge`
#[derive(Parser, Debug, Clone)]
pub struct MergeArgs {
    /// Maximum number of segments to keep
    #[arg(short = 'n', long, default_value = "1")]
    pub max_segments: usize,
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_merge() {
        let args =
            XiphosArgs::try_parse_from(["xiphos", "-i", "/tmp/idx", "merge", "--max-segments", "3"])
                .unwrap();
        assert_eq!(args.index, Some(PathBuf::from("/tmp/idx")));
        match args.command {
            Command::Merge(merge) => assert_eq!(merge.max_segments, 3),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = XiphosArgs::try_parse_from(["xiphos", "info", "-vv", "--format", "json"]).unwrap();
        assert_eq!(args.log_filter(), "debug");
        assert_eq!(args.output_format, OutputFormat::Json);
        assert!(matches!(args.command, Command::Info(InfoArgs { all_commits: false })));
    }

    #[test]
    fn test_dump_segment() {
        let args = XiphosArgs::try_parse_from(["xiphos", "dump", "--segment", "_a"]).unwrap();
        match args.command {
            Command::Dump(dump) => assert_eq!(dump.segment.as_deref(), Some("_a")),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
