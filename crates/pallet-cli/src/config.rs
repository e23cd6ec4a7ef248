use pallet_fetch::FetchConfig;
use pallet_store::InstallLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "PALLET_PREFIX";
pub const ENV_CACHE: &str = "PALLET_CACHE";
pub const ENV_STATE: &str = "PALLET_STATE";

/// Contents of `~/.config/pallet/config.json`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub prefix: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub fetch: FetchConfig,
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("invalid config {}: {e}", path.display()))?;
        config.fetch.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }

    /// An explicit `--config` must exist; the default location is optional.
    pub fn load_or_default(explicit: Option<&Path>, home: Option<&Path>) -> Result<Self, String> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match home.map(default_config_path) {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

pub fn default_config_path(home: &Path) -> PathBuf {
    home.join(".config/pallet/config.json")
}

/// Directory overrides given on the command line.
#[derive(Debug, Default)]
pub struct Overrides {
    pub prefix: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

/// Resolve each directory: flag, then environment, then config file, then default.
pub fn resolve_layout(
    overrides: &Overrides,
    env: impl Fn(&str) -> Option<String>,
    config: &CliConfig,
    home: Option<&Path>,
) -> Result<InstallLayout, String> {
    let prefix = pick(
        overrides.prefix.as_deref(),
        env(ENV_PREFIX).as_deref(),
        config.prefix.as_deref(),
        home,
        ".local",
    )
    .ok_or_else(|| no_home("prefix"))?;
    let cache = pick(
        overrides.cache_dir.as_deref(),
        env(ENV_CACHE).as_deref(),
        config.cache_dir.as_deref(),
        home,
        ".cache/pallet",
    )
    .ok_or_else(|| no_home("cache-dir"))?;
    let state = pick(
        overrides.state_dir.as_deref(),
        env(ENV_STATE).as_deref(),
        config.state_dir.as_deref(),
        home,
        ".local/state/pallet",
    )
    .ok_or_else(|| no_home("state-dir"))?;
    Ok(InstallLayout::new(prefix, cache, state))
}

fn pick(
    flag: Option<&Path>,
    env: Option<&str>,
    file: Option<&Path>,
    home: Option<&Path>,
    default: &str,
) -> Option<PathBuf> {
    if let Some(p) = flag {
        return Some(expand_tilde(p, home));
    }
    if let Some(v) = env.filter(|v| !v.is_empty()) {
        return Some(expand_tilde(Path::new(v), home));
    }
    if let Some(p) = file {
        return Some(expand_tilde(p, home));
    }
    home.map(|h| h.join(default))
}

fn no_home(flag: &str) -> String {
    format!("HOME is not set; pass a directory with --{flag}")
}

pub fn expand_tilde(path: &Path, home: Option<&Path>) -> PathBuf {
    if let (Some(home), Ok(stripped)) = (home, path.strip_prefix("~")) {
        return home.join(stripped);
    }
    path.to_path_buf()
}
