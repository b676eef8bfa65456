use std::path::PathBuf;

use clap::Parser;
use kiln_core::{DeviceMap, DEFAULT_ENCODER, DEFAULT_QUALITY};

/// Service settings. Every option is read from its environment variable
/// (a `.env` file is honoured); flags exist for local overrides.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Kiln image generation server")]
pub struct Config {
    /// Host address to bind the server to
    #[arg(long, env = "KILN_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "KILN_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Directory holding the model weights
    #[arg(long, env = "KILN_MODEL_PATH", default_value = "./flux-local")]
    pub model_path: PathBuf,

    /// `auto`, `cpu`, or an accelerator ordinal
    #[arg(long, env = "KILN_DEVICE", default_value = "auto")]
    pub device: DeviceMap,

    /// JPEG encoder program, by name or path
    #[arg(long, env = "KILN_ENCODER", default_value = DEFAULT_ENCODER)]
    pub encoder: PathBuf,

    /// Directories searched for the encoder after PATH
    #[arg(
        long,
        env = "KILN_ENCODER_SEARCH_PATH",
        default_value = "/opt/mozjpeg/bin",
        value_parser = parse_search_path
    )]
    pub encoder_search_path: SearchPath,

    /// JPEG quality, 1-100
    #[arg(
        long,
        env = "KILN_JPEG_QUALITY",
        default_value_t = DEFAULT_QUALITY,
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    pub jpeg_quality: u8,

    /// Directory for the encoder's scratch files
    #[arg(long, env = "KILN_TMP_DIR")]
    pub tmp_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "KILN_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

/// A platform path list, e.g. `/opt/mozjpeg/bin:/usr/local/bin`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath(pub Vec<PathBuf>);

fn parse_search_path(value: &str) -> Result<SearchPath, String> {
    Ok(SearchPath(
        std::env::split_paths(value)
            .filter(|dir| !dir.as_os_str().is_empty())
            .collect(),
    ))
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
