use crate::{FileLayout, HeapBufferProvider, MemoryLayout};
use anyhow::{bail, Context};
use arc_swap::ArcSwapOption;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

static CONFIG: ArcSwapOption<Config> = ArcSwapOption::const_empty();

/// Loads the configuration once for the whole process. Fails if the file at `path` does not
/// exist, if the merged configuration is invalid, or if configuration was already initialized.
pub fn initialize_config(path: Option<&Path>) -> anyhow::Result<()> {
    let mut paths = vec![];
    if let Some(path) = path {
        if !path.exists() {
            bail!(
                "cannot load configuration from {}; file does not exist",
                path.to_string_lossy()
            );
        }
        paths.push(path.to_path_buf());
    }

    let mut config = load(&paths)?;
    config.config_path = path.map(|p| p.to_path_buf());

    let current = CONFIG.load();
    if current.is_none()
        && CONFIG
            .compare_and_swap(current, Some(Arc::new(config)))
            .is_none()
    {
        return Ok(());
    }

    bail!("unable to initialize configuration; it's already initialized")
}

/// Merges the configuration sources without installing the result as the process-wide config.
pub fn load(paths: &[PathBuf]) -> anyhow::Result<Config> {
    load_config(paths)
        .extract()
        .context("configuration is invalid")
}

pub fn config() -> Arc<Config> {
    if let Some(config) = CONFIG.load_full() {
        return config;
    }

    warn!("Config accessed before initialization! This should only happen in tests.");
    let config = match load_config(&[]).extract::<Config>() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load configuration ({e}); using built-in defaults");
            Config::default()
        }
    };
    let current = CONFIG.load();
    if current.is_none() {
        CONFIG.compare_and_swap(current, Some(Arc::new(config.clone())));
    }

    CONFIG.load_full().unwrap_or_else(|| Arc::new(config))
}

fn load_config(paths: &[PathBuf]) -> Figment {
    // Priority (from highest--overriding--to lowest--overridden) is:
    //   1. SLUICE__* environment variables
    //   2. The config files passed in <paths>
    //   3. sluice.toml in the current directory
    //   4. ../default.toml
    let mut figment = Figment::from(Toml::string(DEFAULT_CONFIG)).admerge(Toml::file("sluice.toml"));

    for path in paths {
        figment = figment.admerge(Toml::file(path));
    }

    figment.admerge(
        Env::prefixed("SLUICE__").map(|p| p.as_str().replace("__", ".").replace('_', "-").into()),
    )
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub worker: WorkerConfig,

    pub buffers: BufferConfig,

    pub slice_store: SliceStoreConfig,

    pub slice_cache: SliceCacheConfig,

    pub spill: SpillConfig,

    pub logging: LoggingConfig,

    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
    /// Number of OS threads pulling tasks from the task queue
    pub number_of_threads: u64,

    /// Capacity of the queue that accepts externally submitted tasks
    pub admission_queue_size: usize,

    /// How long a blocked worker waits before re-checking its stop token
    pub poll_interval_ms: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            number_of_threads: 4,
            admission_queue_size: 1024,
            poll_interval_ms: 50,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BufferConfig {
    pub buffer_size: usize,
    pub page_size: usize,
}

impl BufferConfig {
    pub fn provider(&self) -> HeapBufferProvider {
        HeapBufferProvider::new(self.buffer_size)
    }

    /// Layout of a paged vector holding `tuple_size` byte tuples with a `key_size` byte key.
    pub fn layout(&self, tuple_size: usize, key_size: usize) -> MemoryLayout {
        MemoryLayout::new(tuple_size, key_size, self.page_size)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            page_size: 4096,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SliceStoreType {
    #[default]
    Default,
    FileBacked,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SliceStoreConfig {
    pub r#type: SliceStoreType,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SliceCacheType {
    None,
    Fifo,
    #[default]
    Lru,
    SecondChance,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SliceCacheConfig {
    pub r#type: SliceCacheType,
    pub number_of_entries: u64,
}

impl Default for SliceCacheConfig {
    fn default() -> Self {
        Self {
            r#type: SliceCacheType::Lru,
            number_of_entries: 4,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SpillConfig {
    /// Directory that receives spill files
    pub working_dir: PathBuf,

    /// Size of the write/read buffer of every spill stream; 0 disables buffering
    pub file_buffer_size: usize,

    pub file_layout: FileLayout,

    /// A paged vector is only spilled once it holds more than this many bytes
    pub min_write_state_size: u64,

    /// Slices ending before `watermark + watermark_lookahead` are about to be triggered and
    /// stay in memory
    pub watermark_lookahead: u64,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("/tmp/sluice"),
            file_buffer_size: 4096,
            file_layout: FileLayout::NoSeparation,
            min_write_state_size: 0,
            watermark_lookahead: 0,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Text,
    Logfmt,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Default level of the log filter; `RUST_LOG` takes precedence
    pub level: String,

    pub format: LogFormat,

    /// If set, logs are also written to a daily rolling file in this directory
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            dir: None,
        }
    }
}
