//! Client configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `fusionctl.yaml` but can be specified via `-f` or the `FUSIONCTL_CONFIG`
//! environment variable. A missing file is not an error; every field has a default.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration
//! 2. **Environment variables** - Variables prefixed with `FUSIONCTL_` override YAML values
//!
//! Nested values use double underscores, e.g. `FUSIONCTL_POLLING__INTERVAL=10s`.
//!
//! ## Example
//!
//! ```yaml
//! base_url: https://fusion.example.com/
//! request_timeout: 30s
//! processing_timeout: 10m
//! uploads:
//!   max_file_bytes: 16777216
//!   allowed_types: [jpeg, png, tiff]
//! polling:
//!   interval: 5s
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::Error;
use crate::types::ImageKind;

/// Largest file the server accepts (16 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "FUSIONCTL_CONFIG", default_value = "fusionctl.yaml")]
    pub config: String,

    /// Validate configuration and exit.
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Upload images into a session and optionally start the fusion
    Upload {
        /// Session identifier issued by the server
        #[arg(long)]
        session: String,
        /// Number of images the session was created for
        #[arg(long)]
        required: usize,
        /// Start processing once every image is accepted
        #[arg(long)]
        process: bool,
        /// Image files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Query the status of one or more sessions
    Status {
        /// Session identifiers
        #[arg(long = "session", required = true)]
        sessions: Vec<String>,
        /// Keep polling until each session leaves `processing`
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root URL of the fusion server
    pub base_url: Url,
    /// Log filter used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Timeout for uploads and status queries
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Timeout for the start-processing call, which returns only after the fusion ran
    #[serde(with = "humantime_serde")]
    pub processing_timeout: Duration,
    pub uploads: UploadConfig,
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Files larger than this are rejected locally
    pub max_file_bytes: u64,
    /// Image formats accepted for upload
    pub allowed_types: Vec<ImageKind>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingConfig {
    /// Delay between status queries for a processing session
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://127.0.0.1:5000/").expect("static URL is valid"),
            log_filter: "info".to_string(),
            request_timeout: Duration::from_secs(30),
            processing_timeout: Duration::from_secs(600),
            uploads: UploadConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            allowed_types: ImageKind::ALL.to_vec(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("FUSIONCTL_").ignore(&["CONFIG"]).split("__"))
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<(), Error> {
        if !matches!(self.base_url.scheme(), "http" | "https") {
            return Err(Error::Config {
                message: format!("base_url must be http or https, got {}", self.base_url),
            });
        }

        if self.uploads.max_file_bytes == 0 {
            return Err(Error::Config {
                message: "uploads.max_file_bytes must be greater than zero".to_string(),
            });
        }

        if self.uploads.allowed_types.is_empty() {
            return Err(Error::Config {
                message: "uploads.allowed_types must list at least one image type".to_string(),
            });
        }

        if self.polling.interval.is_zero() {
            return Err(Error::Config {
                message: "polling.interval must be greater than zero".to_string(),
            });
        }

        if self.request_timeout.is_zero() || self.processing_timeout.is_zero() {
            return Err(Error::Config {
                message: "timeouts must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}
