// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::core::analysis::{Analyzer, WhitespaceAnalyzer};
use crate::core::codec::{Codec, DefaultCodec};
use crate::core::index::merge::{MergePolicy, MergeScheduler};
use crate::core::index::merge::{SerialMergeScheduler, TieredMergePolicy};
use crate::core::index::writer::{IndexDeletionPolicy, KeepOnlyLastCommitDeletionPolicy};
use crate::core::util::mb_to_bytes;
use crate::error::{ErrorKind::IllegalArgument, Result};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default value is 16 MB (which means flush when buffered docs consume
/// approximately 16 MB RAM).
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;

/// Default value is 1945. Change using `set_ram_per_thread_hard_limit_mb`.
pub const DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB: u32 = 1945;

/// Default setting for `reader_pooling`
pub const DEFAULT_READER_POOLING: bool = false;

/// Default value for compound file system for newly written segments
/// (set to <code>true</code>). For batch indexing with very large
/// ram buffers use <code>false</code>
pub const DEFAULT_USE_COMPOUND_FILE_SYSTEM: bool = true;

/// Default value for the max number of concurrently indexing threads.
pub const DEFAULT_MAX_THREAD_STATES: usize = 8;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum OpenMode {
    /// Creates a new index or overwrites an existing one.
    Create,
    /// Opens an existing index.
    Append,
    /// Creates a new index if one does not exist, otherwise it opens the
    /// index and documents will be appended.
    CreateOrAppend,
}

/// Holds all the configuration that is used to create an `IndexWriter`.
/// Once `IndexWriter` has been created with this object, changes to this
/// object will not affect the `IndexWriter` instance.
///
/// Setters consume and return the config to allow chaining:
///
/// ```ignore
/// let config = IndexWriterConfig::default()
///     .set_max_buffered_docs(Some(1000))
///     .set_use_compound_file(false);
/// ```
pub struct IndexWriterConfig {
    /// `None` disables flushing by RAM usage.
    pub ram_buffer_size_mb: Option<f64>,
    /// `None` disables flushing by buffered document count.
    pub max_buffered_docs: Option<u32>,
    /// `None` disables applying deletes by buffered delete term count.
    pub max_buffered_delete_terms: Option<u32>,
    pub ram_per_thread_hard_limit_mb: u32,
    pub use_compound_file: bool,
    /// True if readers should be pooled.
    pub reader_pooling: bool,
    pub commit_on_close: bool,
    pub open_mode: OpenMode,
    pub write_lock_timeout: Duration,
    pub max_thread_states: usize,
    pub codec: Arc<dyn Codec>,
    pub analyzer: Arc<dyn Analyzer>,
    pub merge_policy: Arc<dyn MergePolicy>,
    pub merge_scheduler: Arc<dyn MergeScheduler>,
    pub deletion_policy: Arc<dyn IndexDeletionPolicy>,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            ram_per_thread_hard_limit_mb: DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB,
            use_compound_file: DEFAULT_USE_COMPOUND_FILE_SYSTEM,
            reader_pooling: DEFAULT_READER_POOLING,
            commit_on_close: true,
            open_mode: OpenMode::CreateOrAppend,
            write_lock_timeout: Duration::from_millis(0),
            max_thread_states: DEFAULT_MAX_THREAD_STATES,
            codec: DefaultCodec::shared(),
            analyzer: Arc::new(WhitespaceAnalyzer),
            merge_policy: Arc::new(TieredMergePolicy::default()),
            merge_scheduler: Arc::new(SerialMergeScheduler::default()),
            deletion_policy: Arc::new(KeepOnlyLastCommitDeletionPolicy),
        }
    }
}

impl IndexWriterConfig {
    pub fn set_ram_buffer_size_mb(mut self, mb: Option<f64>) -> Self {
        self.ram_buffer_size_mb = mb;
        self
    }

    pub fn set_max_buffered_docs(mut self, max: Option<u32>) -> Self {
        self.max_buffered_docs = max;
        self
    }

    pub fn set_max_buffered_delete_terms(mut self, max: Option<u32>) -> Self {
        self.max_buffered_delete_terms = max;
        self
    }

    pub fn set_ram_per_thread_hard_limit_mb(mut self, mb: u32) -> Self {
        self.ram_per_thread_hard_limit_mb = mb;
        self
    }

    pub fn set_use_compound_file(mut self, use_compound_file: bool) -> Self {
        self.use_compound_file = use_compound_file;
        self
    }

    pub fn set_reader_pooling(mut self, pooling: bool) -> Self {
        self.reader_pooling = pooling;
        self
    }

    pub fn set_commit_on_close(mut self, commit_on_close: bool) -> Self {
        self.commit_on_close = commit_on_close;
        self
    }

    pub fn set_open_mode(mut self, open_mode: OpenMode) -> Self {
        self.open_mode = open_mode;
        self
    }

    pub fn set_write_lock_timeout(mut self, timeout: Duration) -> Self {
        self.write_lock_timeout = timeout;
        self
    }

    pub fn set_max_thread_states(mut self, max: usize) -> Self {
        self.max_thread_states = max;
        self
    }

    pub fn set_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn set_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn set_merge_policy(mut self, merge_policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = merge_policy;
        self
    }

    pub fn set_merge_scheduler(mut self, merge_scheduler: Arc<dyn MergeScheduler>) -> Self {
        self.merge_scheduler = merge_scheduler;
        self
    }

    pub fn set_deletion_policy(mut self, deletion_policy: Arc<dyn IndexDeletionPolicy>) -> Self {
        self.deletion_policy = deletion_policy;
        self
    }

    pub fn flush_on_ram(&self) -> bool {
        self.ram_buffer_size_mb.is_some()
    }

    pub fn flush_on_doc_count(&self) -> bool {
        self.max_buffered_docs.is_some()
    }

    pub fn flush_on_delete_terms(&self) -> bool {
        self.max_buffered_delete_terms.is_some()
    }

    pub fn max_buffered_docs(&self) -> u32 {
        self.max_buffered_docs.unwrap_or(0)
    }

    pub fn max_buffered_delete_terms(&self) -> u32 {
        self.max_buffered_delete_terms.unwrap_or(0)
    }

    /// The RAM budget in bytes, `None` if flushing by RAM is disabled.
    pub fn ram_buffer_size_bytes(&self) -> Option<u64> {
        self.ram_buffer_size_mb.map(mb_to_bytes)
    }

    pub fn ram_per_thread_hard_limit_bytes(&self) -> u64 {
        mb_to_bytes(f64::from(self.ram_per_thread_hard_limit_mb))
    }

    /// Rejects settings an `IndexWriter` can not work with.
    pub fn validate(&self) -> Result<()> {
        if self.ram_buffer_size_mb.is_none() && self.max_buffered_docs.is_none() {
            bail!(IllegalArgument(
                "at least one of ram_buffer_size_mb and max_buffered_docs must be enabled".into()
            ));
        }
        if let Some(mb) = self.ram_buffer_size_mb {
            if !(mb > 0.0) {
                bail!(IllegalArgument(format!(
                    "ram_buffer_size_mb should be > 0.0 MB when enabled, got {}",
                    mb
                )));
            }
        }
        if let Some(max) = self.max_buffered_docs {
            if max < 2 {
                bail!(IllegalArgument(format!(
                    "max_buffered_docs must at least be 2 when enabled, got {}",
                    max
                )));
            }
        }
        if self.max_buffered_delete_terms == Some(0) {
            bail!(IllegalArgument(
                "max_buffered_delete_terms must at least be 1 when enabled".into()
            ));
        }
        if self.ram_per_thread_hard_limit_mb == 0 || self.ram_per_thread_hard_limit_mb >= 2048 {
            bail!(IllegalArgument(format!(
                "ram_per_thread_hard_limit_mb must be greater than 0 and less than 2048MB \
                 (2GB), got {}",
                self.ram_per_thread_hard_limit_mb
            )));
        }
        if self.max_thread_states == 0 {
            bail!(IllegalArgument("max_thread_states must be >= 1".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for IndexWriterConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IndexWriterConfig")
            .field("ram_buffer_size_mb", &self.ram_buffer_size_mb)
            .field("max_buffered_docs", &self.max_buffered_docs)
            .field("max_buffered_delete_terms", &self.max_buffered_delete_terms)
            .field(
                "ram_per_thread_hard_limit_mb",
                &self.ram_per_thread_hard_limit_mb,
            )
            .field("use_compound_file", &self.use_compound_file)
            .field("reader_pooling", &self.reader_pooling)
            .field("commit_on_close", &self.commit_on_close)
            .field("open_mode", &self.open_mode)
            .field("write_lock_timeout", &self.write_lock_timeout)
            .field("max_thread_states", &self.max_thread_states)
            .field("codec", &self.codec.name())
            .field("merge_policy", &self.merge_policy)
            .finish()
    }
}

/// The numeric tunables of `IndexWriterConfig`, as they appear in a JSON
/// settings file. Missing keys keep their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWriterSettings {
    pub ram_buffer_size_mb: Option<f64>,
    pub max_buffered_docs: Option<u32>,
    pub max_buffered_delete_terms: Option<u32>,
    pub ram_per_thread_hard_limit_mb: u32,
    pub use_compound_file: bool,
    pub reader_pooling: bool,
    pub commit_on_close: bool,
    pub open_mode: OpenMode,
    pub write_lock_timeout_ms: u64,
    pub max_thread_states: usize,
}

impl Default for IndexWriterSettings {
    fn default() -> Self {
        IndexWriterSettings::from(&IndexWriterConfig::default())
    }
}

impl<'a> From<&'a IndexWriterConfig> for IndexWriterSettings {
    fn from(config: &'a IndexWriterConfig) -> Self {
        IndexWriterSettings {
            ram_buffer_size_mb: config.ram_buffer_size_mb,
            max_buffered_docs: config.max_buffered_docs,
            max_buffered_delete_terms: config.max_buffered_delete_terms,
            ram_per_thread_hard_limit_mb: config.ram_per_thread_hard_limit_mb,
            use_compound_file: config.use_compound_file,
            reader_pooling: config.reader_pooling,
            commit_on_close: config.commit_on_close,
            open_mode: config.open_mode,
            write_lock_timeout_ms: config.write_lock_timeout.as_millis() as u64,
            max_thread_states: config.max_thread_states,
        }
    }
}

impl IndexWriterSettings {
    pub fn from_json(json: &str) -> Result<IndexWriterSettings> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Copies these settings onto `config`, keeping its collaborators.
    pub fn apply(&self, config: IndexWriterConfig) -> Result<IndexWriterConfig> {
        let config = config
            .set_ram_buffer_size_mb(self.ram_buffer_size_mb)
            .set_max_buffered_docs(self.max_buffered_docs)
            .set_max_buffered_delete_terms(self.max_buffered_delete_terms)
            .set_ram_per_thread_hard_limit_mb(self.ram_per_thread_hard_limit_mb)
            .set_use_compound_file(self.use_compound_file)
            .set_reader_pooling(self.reader_pooling)
            .set_commit_on_close(self.commit_on_close)
            .set_open_mode(self.open_mode)
            .set_write_lock_timeout(Duration::from_millis(self.write_lock_timeout_ms))
            .set_max_thread_states(self.max_thread_states);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() -> Result<()> {
        let config = IndexWriterConfig::default();
        config.validate()?;
        assert_eq!(config.ram_buffer_size_mb, Some(16.0));
        assert_eq!(config.ram_buffer_size_bytes(), Some(16 * 1024 * 1024));
        assert!(!config.flush_on_doc_count());
        assert!(!config.flush_on_delete_terms());
        assert_eq!(config.ram_per_thread_hard_limit_mb, 1945);
        assert_eq!(config.open_mode, OpenMode::CreateOrAppend);
        assert!(config.use_compound_file);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = IndexWriterConfig::default()
            .set_ram_buffer_size_mb(None)
            .set_max_buffered_docs(None);
        assert!(config.validate().is_err());

        let config = IndexWriterConfig::default()
            .set_ram_buffer_size_mb(None)
            .set_max_buffered_docs(Some(10));
        assert!(config.validate().is_ok());

        assert!(IndexWriterConfig::default()
            .set_max_buffered_docs(Some(1))
            .validate()
            .is_err());
        assert!(IndexWriterConfig::default()
            .set_ram_buffer_size_mb(Some(0.0))
            .validate()
            .is_err());
        assert!(IndexWriterConfig::default()
            .set_ram_per_thread_hard_limit_mb(2048)
            .validate()
            .is_err());
        assert!(IndexWriterConfig::default()
            .set_max_buffered_delete_terms(Some(0))
            .validate()
            .is_err());
        assert!(IndexWriterConfig::default()
            .set_max_thread_states(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_settings_from_json() -> Result<()> {
        let settings = IndexWriterSettings::from_json(
            r#"{"ram_buffer_size_mb": null, "max_buffered_docs": 100,
                "open_mode": "Create", "write_lock_timeout_ms": 250}"#,
        )?;
        assert_eq!(settings.max_buffered_docs, Some(100));
        assert_eq!(settings.ram_per_thread_hard_limit_mb, 1945);

        let config = settings.apply(IndexWriterConfig::default())?;
        assert_eq!(config.ram_buffer_size_mb, None);
        assert_eq!(config.max_buffered_docs(), 100);
        assert_eq!(config.open_mode, OpenMode::Create);
        assert_eq!(config.write_lock_timeout, Duration::from_millis(250));

        let round = IndexWriterSettings::from_json(&settings.to_json()?)?;
        assert_eq!(round, settings);

        let invalid = IndexWriterSettings::from_json(r#"{"ram_buffer_size_mb": null}"#)?;
        assert!(invalid.apply(IndexWriterConfig::default()).is_err());
        Ok(())
    }
}
