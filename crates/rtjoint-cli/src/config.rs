//! Configuration file – reads/writes the TOML file the `rtjoint` binary runs
//! from.
//!
//! ```toml
//! [run]
//! duration_secs = 10.0
//!
//! [control]
//! frequency_hz = 500.0
//! seed = 42
//!
//! [[control.channels]]
//! id = "hip_left"
//! target = 0.3
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use rtjoint_runtime::ControlLoopConfig;
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file when no argument is given.
pub const CONFIG_ENV: &str = "RTJOINT_CONFIG";

/// Settings of the binary itself, as opposed to the control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Stop after this many seconds.  Runs until Ctrl-C (or the exit policy)
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Print one telemetry line every this many cycles; `0` disables it.
    pub telemetry_every: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            duration_secs: None,
            telemetry_every: 250,
        }
    }
}

/// Everything in the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub control: ControlLoopConfig,
}

/// The config file to use: the first CLI argument, else `$RTJOINT_CONFIG`.
pub fn resolve_path(arg: Option<&str>) -> Option<PathBuf> {
    arg.map(PathBuf::from)
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
}

/// Load the config.  A missing path (or no path at all) yields the defaults;
/// environment overrides are applied either way.
pub fn load(path: Option<&Path>) -> Result<Config, String> {
    let mut cfg = match path {
        Some(path) => load_from(path)?.unwrap_or_default(),
        None => Config::default(),
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse a specific file.  Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `RTJOINT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `RTJOINT_FREQUENCY_HZ` | `control.frequency_hz` |
/// | `RTJOINT_SEED` | `control.seed` |
/// | `RTJOINT_DURATION_SECS` | `run.duration_secs` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

/// Unparseable values are ignored.
fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(hz) = lookup("RTJOINT_FREQUENCY_HZ").and_then(|v| v.parse::<f64>().ok()) {
        cfg.control.frequency_hz = hz;
    }
    if let Some(seed) = lookup("RTJOINT_SEED").and_then(|v| v.parse::<u64>().ok()) {
        cfg.control.seed = seed;
    }
    if let Some(secs) = lookup("RTJOINT_DURATION_SECS").and_then(|v| v.parse::<f64>().ok()) {
        cfg.run.duration_secs = Some(secs);
    }
}

/// Write `cfg` to `path`, creating parent directories as needed.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
