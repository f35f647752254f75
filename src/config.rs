// --- TOML configuration and input discovery ---

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Configuration file layout: a single `[main]` table.
///
/// ```toml
/// [main]
/// input = "./data"
/// output = "./output"
/// filename_mask = ["trades", "2024"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub main: MainConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainConfig {
    /// Directory scanned for `.csv` input files.
    pub input: PathBuf,
    /// Directory the result CSV is written into.
    #[serde(default = "default_output_dir")]
    pub output: PathBuf,
    /// When non-empty, only basenames containing one of these substrings
    /// are picked up.
    #[serde(default)]
    pub filename_mask: Vec<String>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// Lists the CSV files the configuration selects, sorted for a
/// deterministic processing order.
pub fn find_input_files(cfg: &Config) -> Result<Vec<PathBuf>> {
    let dir = &cfg.main.input;
    if !dir.is_dir() {
        anyhow::bail!("Input directory does not exist: {}", dir.display());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read input directory {}", dir.display()))?
    {
        let path = entry?.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "csv") {
            continue;
        }
        if matches_mask(&path, &cfg.main.filename_mask) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn matches_mask(path: &Path, masks: &[String]) -> bool {
    if masks.is_empty() {
        return true;
    }
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    masks.iter().any(|mask| name.contains(mask.as_str()))
}
