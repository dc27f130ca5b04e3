use std::path::PathBuf;
use std::sync::OnceLock;

static CONTEXTD_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Returns the contextd home directory (`~/.contextd/`).
/// Supports `$CONTEXTD_HOME` env override. Cached via `OnceLock`.
pub fn contextd_home() -> &'static PathBuf {
    CONTEXTD_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("CONTEXTD_HOME") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".contextd")
    })
}

/// `~/.contextd/config/`
pub fn config_dir() -> PathBuf {
    contextd_home().join("config")
}

/// `~/.contextd/logs/`
pub fn logs_dir() -> PathBuf {
    contextd_home().join("logs")
}

/// `~/.contextd/data/`
pub fn data_dir() -> PathBuf {
    contextd_home().join("data")
}

/// Default user-level scrub allowlist: `~/.contextd/config/allowlist.toml`.
pub fn user_allowlist_file() -> PathBuf {
    config_dir().join("allowlist.toml")
}
