pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};

pub use parse::{load_config, parse_config, validate_config, ConfigError};
pub use types::{
    BatchingConfig, BroadcastConfig, CacheConfig, Config, DemandDensityConfig, GeofenceConfig,
    OverflowStrategy, QueueConfig, RetryConfig, StorageConfig, TriggersConfig, WebConfig,
};

/// `$env{VAR_NAME}`, where the name starts with a letter or underscore.
pub(crate) const ENV_VAR_PATTERN: &str = r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// Sample configuration written by `fleetline config init`.
pub const SAMPLE_CONFIG: &str = include_str!("../../samples/sample-config.yml");

/// Expands `$env{VAR_NAME}` references. Unset variables are left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    let Ok(re) = Regex::new(ENV_VAR_PATTERN) else {
        return text.to_string();
    };

    re.replace_all(text, |caps: &regex::Captures| {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        caps.get(1)
            .and_then(|name| std::env::var(name.as_str()).ok())
            .unwrap_or_else(|| whole.to_string())
    })
    .into_owned()
}

/// Expands a leading `~` to the home directory when one can be determined.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// Resolves the config file: an explicit path wins, then
/// `~/.config/fleetline/config.yml`, then `/etc/fleetline/config.yml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/fleetline/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/fleetline/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}
