//! Writer configuration.
//!
//! [`IndexWriterConfig`] is the in-process configuration handed to
//! [`IndexWriter::open`](crate::index::writer::IndexWriter::open). It holds
//! trait objects (codec, analyzer, merge policy) and is therefore not
//! serializable itself; [`IndexWriterSettings`] is its serializable subset,
//! loadable from JSON.
//!
//! # Example
//!
//! ```
//! use xiphos::index::config::{IndexWriterSettings, OpenMode};
//!
//! let settings = IndexWriterSettings::from_json(
//!     r#"{"max_buffered_docs": 500, "codec": "text", "open_mode": "create"}"#,
//! )
//! .unwrap();
//! let config = settings.into_config().unwrap();
//! assert_eq!(config.max_buffered_docs, 500);
//! assert_eq!(config.codec.name(), "text");
//! assert_eq!(config.open_mode, OpenMode::Create);
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::analysis::analyzer::{Analyzer, StandardAnalyzer};
use crate::codec::{Codec, CodecRegistry, default_codec};
use crate::error::{Result, XiphosError};
use crate::index::merge_policy::{MergePolicy, NoMergePolicy, TieredMergePolicy, TieredMergePolicyConfig};
use crate::index::merge_scheduler::MergeSchedulerConfig;

/// What to do with an existing index when a writer opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Start a new, empty index. Existing commits stay readable until the
    /// first commit of the writer supersedes them.
    Create,
    /// Open an existing index; fail if there is none.
    Append,
    /// Append if an index exists, create otherwise.
    #[default]
    CreateOrAppend,
}

/// Configuration of an [`IndexWriter`](crate::index::writer::IndexWriter).
#[derive(Clone)]
pub struct IndexWriterConfig {
    /// Flush once this many documents are buffered.
    pub max_buffered_docs: usize,

    /// Flush once the buffer's estimated size reaches this many bytes.
    pub ram_buffer_size_bytes: usize,

    /// Codec bound to the writer. Every segment it writes records its name.
    pub codec: Arc<dyn Codec>,

    /// Codecs available for reading existing segments.
    pub codecs: CodecRegistry,

    /// Analyzer for `IndexedText` fields.
    pub analyzer: Arc<dyn Analyzer>,

    pub merge_policy: Arc<dyn MergePolicy>,

    pub merge_scheduler: MergeSchedulerConfig,

    pub open_mode: OpenMode,

    /// Commit pending changes on `close()`.
    pub commit_on_close: bool,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            max_buffered_docs: 1000,
            ram_buffer_size_bytes: 16 * 1024 * 1024,
            codec: default_codec(),
            codecs: CodecRegistry::default(),
            analyzer: Arc::new(StandardAnalyzer::new()),
            merge_policy: Arc::new(TieredMergePolicy::default()),
            merge_scheduler: MergeSchedulerConfig::default(),
            open_mode: OpenMode::default(),
            commit_on_close: true,
        }
    }
}

impl std::fmt::Debug for IndexWriterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriterConfig")
            .field("max_buffered_docs", &self.max_buffered_docs)
            .field("ram_buffer_size_bytes", &self.ram_buffer_size_bytes)
            .field("codec", &self.codec.name())
            .field("codecs", &self.codecs.names())
            .field("analyzer", &self.analyzer.name())
            .field("merge_policy", &self.merge_policy)
            .field("merge_scheduler", &self.merge_scheduler)
            .field("open_mode", &self.open_mode)
            .field("commit_on_close", &self.commit_on_close)
            .finish()
    }
}

impl IndexWriterConfig {
    pub fn new() -> Self {
        IndexWriterConfig::default()
    }

    pub fn with_max_buffered_docs(mut self, max_buffered_docs: usize) -> Self {
        self.max_buffered_docs = max_buffered_docs;
        self
    }

    pub fn with_ram_buffer_size_bytes(mut self, bytes: usize) -> Self {
        self.ram_buffer_size_bytes = bytes;
        self
    }

    /// Bind `codec` and make sure it can be resolved when reading back.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codecs.register(Arc::clone(&codec));
        self.codec = codec;
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_merge_policy(mut self, merge_policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = merge_policy;
        self
    }

    pub fn with_merge_scheduler(mut self, merge_scheduler: MergeSchedulerConfig) -> Self {
        self.merge_scheduler = merge_scheduler;
        self
    }

    pub fn with_open_mode(mut self, open_mode: OpenMode) -> Self {
        self.open_mode = open_mode;
        self
    }

    pub fn with_commit_on_close(mut self, commit_on_close: bool) -> Self {
        self.commit_on_close = commit_on_close;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_buffered_docs == 0 {
            return Err(XiphosError::invalid_argument("max_buffered_docs must be at least 1"));
        }
        if self.ram_buffer_size_bytes == 0 {
            return Err(XiphosError::invalid_argument(
                "ram_buffer_size_bytes must be at least 1",
            ));
        }
        self.codecs.get(self.codec.name())?;
        Ok(())
    }
}

/// Which merge policy to build from settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergePolicySettings {
    Tiered(TieredMergePolicyConfig),
    NoMerge,
}

impl Default for MergePolicySettings {
    fn default() -> Self {
        MergePolicySettings::Tiered(TieredMergePolicyConfig::default())
    }
}

/// Serializable writer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWriterSettings {
    pub max_buffered_docs: usize,
    pub ram_buffer_size_bytes: usize,
    /// Codec name, resolved through the default registry.
    pub codec: String,
    pub merge_policy: MergePolicySettings,
    pub merge_scheduler: MergeSchedulerConfig,
    pub open_mode: OpenMode,
    pub commit_on_close: bool,
}

impl Default for IndexWriterSettings {
    fn default() -> Self {
        let config = IndexWriterConfig::default();
        IndexWriterSettings {
            max_buffered_docs: config.max_buffered_docs,
            ram_buffer_size_bytes: config.ram_buffer_size_bytes,
            codec: config.codec.name().to_string(),
            merge_policy: MergePolicySettings::default(),
            merge_scheduler: config.merge_scheduler,
            open_mode: config.open_mode,
            commit_on_close: config.commit_on_close,
        }
    }
}

impl IndexWriterSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build the runtime configuration.
    pub fn into_config(self) -> Result<IndexWriterConfig> {
        let base = IndexWriterConfig::default();
        let codec = base.codecs.get(&self.codec)?;
        let merge_policy: Arc<dyn MergePolicy> = match self.merge_policy {
            MergePolicySettings::Tiered(config) => Arc::new(TieredMergePolicy::new(config)),
            MergePolicySettings::NoMerge => Arc::new(NoMergePolicy),
        };
        let config = base
            .with_codec(codec)
            .with_max_buffered_docs(self.max_buffered_docs)
            .with_ram_buffer_size_bytes(self.ram_buffer_size_bytes)
            .with_merge_policy(merge_policy)
            .with_merge_scheduler(self.merge_scheduler)
            .with_open_mode(self.open_mode)
            .with_commit_on_close(self.commit_on_close);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IndexWriterConfig::default();
        assert_eq!(config.max_buffered_docs, 1000);
        assert_eq!(config.codec.name(), "binary");
        assert_eq!(config.open_mode, OpenMode::CreateOrAppend);
        assert!(config.commit_on_close);
        assert!(config.validate().is_ok());
        assert!(config.with_max_buffered_docs(0).validate().is_err());
    }

    #[test]
    fn test_settings_json() {
        let settings = IndexWriterSettings::from_json(
            r#"{
                "merge_policy": {"type": "no_merge"},
                "merge_scheduler": {"type": "serial"}
            }"#,
        )
        .unwrap();
        assert_eq!(settings.merge_policy, MergePolicySettings::NoMerge);
        assert_eq!(settings.codec, "binary");

        let config = settings.clone().into_config().unwrap();
        assert_eq!(config.merge_scheduler, MergeSchedulerConfig::Serial);
        assert_eq!(config.merge_policy.get_config()["policy_type"], "no_merge");

        let round = IndexWriterSettings::from_json(&settings.to_json().unwrap()).unwrap();
        assert_eq!(round, settings);
    }

    #[test]
    fn test_unknown_codec_is_rejected() {
        let settings = IndexWriterSettings {
            codec: "zstd".into(),
            ..Default::default()
        };
        assert!(matches!(settings.into_config(), Err(XiphosError::Codec(_))));
    }
}
