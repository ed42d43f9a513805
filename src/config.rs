//! Configuration layer
//!
//! Driver settings come from three layers with precedence
//! CLI > TOML config file > built-in defaults. A missing or malformed config
//! file degrades to the defaults with a warning; validation failures are
//! hard errors the drivers turn into a non-zero exit.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use argh::FromArgs;
use log::warn;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

const DEFAULT_MIN_ORDER: usize = 6;
const DEFAULT_MAX_ORDER: usize = 20;
const DEFAULT_ALIGNMENT: usize = 8;
const DEFAULT_OPS: usize = 1000;
const DEFAULT_DURATION_SECS: f64 = 10.0;
const DEFAULT_BLOCK_SIZE: usize = 64;
const DEFAULT_MIN_BLOCK_SIZE: usize = 32;
const DEFAULT_MAX_BLOCK_SIZE: usize = 512;
const DEFAULT_THREADS: usize = 1;
const DEFAULT_SEED: u64 = 42;
const DEFAULT_OUT_DIR: &str = "reports";

/// Buddy allocator workload and benchmark driver.
#[derive(Debug, Default, FromArgs)]
pub struct Args {
    /// workload to run (sequential, random or mixed)
    #[argh(option)]
    pub test: Option<String>,
    /// benchmark to run (fixed, variable or throughput)
    #[argh(option)]
    pub benchmark: Option<String>,
    /// number of operations per run
    #[argh(option)]
    pub ops: Option<usize>,
    /// duration in seconds for throughput runs
    #[argh(option)]
    pub duration: Option<f64>,
    /// block size in bytes for fixed-size runs
    #[argh(option)]
    pub block_size: Option<usize>,
    /// minimum block size in bytes for variable-size runs
    #[argh(option)]
    pub min_block_size: Option<usize>,
    /// maximum block size in bytes for variable-size runs
    #[argh(option)]
    pub max_block_size: Option<usize>,
    /// minimum buddy order (smallest block is 2^min-order bytes)
    #[argh(option)]
    pub min_order: Option<usize>,
    /// maximum buddy order (pool size is 2^max-order bytes)
    #[argh(option)]
    pub max_order: Option<usize>,
    /// payload alignment in bytes (power of two)
    #[argh(option)]
    pub alignment: Option<usize>,
    /// number of worker threads
    #[argh(option)]
    pub threads: Option<usize>,
    /// seed for the deterministic size generator
    #[argh(option)]
    pub seed: Option<u64>,
    /// output directory for CSV reports
    #[argh(option)]
    pub out: Option<String>,
    /// output format (csv)
    #[argh(option)]
    pub format: Option<String>,
    /// path to the TOML config file
    #[argh(option)]
    pub config: Option<PathBuf>,
}

/// Configuration rejected before any pool is constructed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("min-order ({min}) must be less than max-order ({max})")]
    OrderRange { min: usize, max: usize },
    #[error("max-order {0} too large (would exceed reasonable memory limits)")]
    MaxOrderTooLarge(usize),
    #[error("alignment {0} must be a non-zero power of 2")]
    BadAlignment(usize),
    #[error("threads must be at least 1")]
    NoThreads,
    #[error("block size range {min}..{max} is empty")]
    EmptyBlockRange { min: usize, max: usize },
    #[error("unknown output format {0:?} (expected \"csv\")")]
    UnknownFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Csv,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(Self::Csv),
            other => Err(ConfigError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub allocator: AllocatorSection,
    #[serde(default)]
    pub testing: TestingSection,
    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AllocatorSection {
    pub min_order: Option<usize>,
    pub max_order: Option<usize>,
    pub alignment: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TestingSection {
    pub num_operations: Option<usize>,
    pub duration_seconds: Option<f64>,
    pub block_size: Option<usize>,
    pub min_block_size: Option<usize>,
    pub max_block_size: Option<usize>,
    pub random_seed: Option<u64>,
    pub threads: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub directory: Option<String>,
    pub format: Option<String>,
}

impl FileConfig {
    /// Parse a TOML document.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load `path`, degrading to defaults with a warning when the file is
    /// missing or malformed (matching the drivers' permissive startup).
    pub fn load_or_default(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(
                    "config file {} not found ({err}); using defaults",
                    path.display()
                );
                return Self::default();
            }
        };
        match Self::parse(&content) {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    "failed to parse config file {}: {err}; using defaults",
                    path.display()
                );
                Self::default()
            }
        }
    }
}

/// Fully resolved driver settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub test: Option<String>,
    pub benchmark: Option<String>,
    pub ops: usize,
    pub duration: f64,
    pub block_size: usize,
    pub min_block_size: usize,
    pub max_block_size: usize,
    pub min_order: usize,
    pub max_order: usize,
    pub alignment: usize,
    pub threads: usize,
    pub seed: u64,
    pub out: String,
    pub format: OutputFormat,
}

impl Settings {
    /// Merge CLI arguments over the config file over the defaults, then
    /// validate.
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let config_path = args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let file = FileConfig::load_or_default(&config_path);

        let format = match args.format.as_deref().or(file.output.format.as_deref()) {
            Some(s) => s.parse()?,
            None => OutputFormat::default(),
        };

        let settings = Self {
            test: args.test.clone(),
            benchmark: args.benchmark.clone(),
            ops: args
                .ops
                .or(file.testing.num_operations)
                .unwrap_or(DEFAULT_OPS),
            duration: args
                .duration
                .or(file.testing.duration_seconds)
                .unwrap_or(DEFAULT_DURATION_SECS),
            block_size: args
                .block_size
                .or(file.testing.block_size)
                .unwrap_or(DEFAULT_BLOCK_SIZE),
            min_block_size: args
                .min_block_size
                .or(file.testing.min_block_size)
                .unwrap_or(DEFAULT_MIN_BLOCK_SIZE),
            max_block_size: args
                .max_block_size
                .or(file.testing.max_block_size)
                .unwrap_or(DEFAULT_MAX_BLOCK_SIZE),
            min_order: args
                .min_order
                .or(file.allocator.min_order)
                .unwrap_or(DEFAULT_MIN_ORDER),
            max_order: args
                .max_order
                .or(file.allocator.max_order)
                .unwrap_or(DEFAULT_MAX_ORDER),
            alignment: args
                .alignment
                .or(file.allocator.alignment)
                .unwrap_or(DEFAULT_ALIGNMENT),
            threads: args
                .threads
                .or(file.testing.threads)
                .unwrap_or(DEFAULT_THREADS),
            seed: args.seed.or(file.testing.random_seed).unwrap_or(DEFAULT_SEED),
            out: args
                .out
                .clone()
                .or(file.output.directory)
                .unwrap_or_else(|| DEFAULT_OUT_DIR.to_string()),
            format,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_order >= self.max_order {
            return Err(ConfigError::OrderRange {
                min: self.min_order,
                max: self.max_order,
            });
        }
        if self.max_order > crate::buddy::pool::MAX_ORDER_CEILING {
            return Err(ConfigError::MaxOrderTooLarge(self.max_order));
        }
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(ConfigError::BadAlignment(self.alignment));
        }
        if self.threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.min_block_size > self.max_block_size {
            return Err(ConfigError::EmptyBlockRange {
                min: self.min_block_size,
                max: self.max_block_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_document() {
        let content = r#"
            [allocator]
            min_order = 7
            max_order = 18
            alignment = 16

            [testing]
            num_operations = 5000
            duration_seconds = 2.5
            random_seed = 7
            threads = 4

            [output]
            directory = "out"
            format = "csv"
        "#;
        let config = FileConfig::parse(content).unwrap();
        assert_eq!(config.allocator.min_order, Some(7));
        assert_eq!(config.allocator.max_order, Some(18));
        assert_eq!(config.testing.num_operations, Some(5000));
        assert_eq!(config.testing.duration_seconds, Some(2.5));
        assert_eq!(config.testing.threads, Some(4));
        assert_eq!(config.output.directory.as_deref(), Some("out"));
    }

    #[test]
    fn test_missing_sections_default() {
        let config = FileConfig::parse("[allocator]\nmin_order = 5\n").unwrap();
        assert_eq!(config.allocator.min_order, Some(5));
        assert_eq!(config.allocator.max_order, None);
        assert_eq!(config.testing.num_operations, None);
    }

    #[test]
    fn test_cli_beats_file_beats_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[allocator]\nmin_order = 8\nmax_order = 16").unwrap();

        let args = Args {
            min_order: Some(7),
            config: Some(path),
            ..Args::default()
        };
        let settings = Settings::resolve(&args).unwrap();

        assert_eq!(settings.min_order, 7); // CLI wins
        assert_eq!(settings.max_order, 16); // file wins
        assert_eq!(settings.ops, DEFAULT_OPS); // default survives
    }

    #[test]
    fn test_missing_file_degrades_to_defaults() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/config.toml")),
            ..Args::default()
        };
        let settings = Settings::resolve(&args).unwrap();
        assert_eq!(settings.min_order, DEFAULT_MIN_ORDER);
        assert_eq!(settings.max_order, DEFAULT_MAX_ORDER);
        assert_eq!(settings.seed, DEFAULT_SEED);
    }

    #[test]
    fn test_validation_rejections() {
        let base = Args {
            config: Some(PathBuf::from("/nonexistent/config.toml")),
            ..Args::default()
        };

        let args = Args {
            min_order: Some(12),
            max_order: Some(12),
            ..base
        };
        assert!(matches!(
            Settings::resolve(&args).unwrap_err(),
            ConfigError::OrderRange { .. }
        ));

        let args = Args {
            max_order: Some(40),
            config: Some(PathBuf::from("/nonexistent/config.toml")),
            ..Args::default()
        };
        assert!(matches!(
            Settings::resolve(&args).unwrap_err(),
            ConfigError::MaxOrderTooLarge(40)
        ));

        let args = Args {
            alignment: Some(12),
            config: Some(PathBuf::from("/nonexistent/config.toml")),
            ..Args::default()
        };
        assert!(matches!(
            Settings::resolve(&args).unwrap_err(),
            ConfigError::BadAlignment(12)
        ));

        let args = Args {
            threads: Some(0),
            config: Some(PathBuf::from("/nonexistent/config.toml")),
            ..Args::default()
        };
        assert!(matches!(
            Settings::resolve(&args).unwrap_err(),
            ConfigError::NoThreads
        ));
    }

    #[test]
    fn test_unknown_format_rejected() {
        let args = Args {
            format: Some("xml".to_string()),
            config: Some(PathBuf::from("/nonexistent/config.toml")),
            ..Args::default()
        };
        assert!(matches!(
            Settings::resolve(&args).unwrap_err(),
            ConfigError::UnknownFormat(_)
        ));
    }
}
