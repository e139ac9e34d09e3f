use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::AppCore;

const CONFIG_FILE: &str = "courier_config.json";
const STORE_FILE: &str = "courier_store.sqlite3";

const DEFAULT_SCHEDULER_INTERVAL_MS: u64 = 5_000;
const DEFAULT_TYPING_IDLE_MS: u64 = 3_000;
const DEFAULT_SNAPSHOT_GRACE_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    pub(crate) relay_url: Option<String>,
    pub(crate) store_path: Option<String>,
    pub(crate) disable_network: Option<bool>,
    pub(crate) scheduler_interval_ms: Option<u64>,
    pub(crate) typing_idle_ms: Option<u64>,
    pub(crate) snapshot_grace_ms: Option<u64>,
    pub(crate) conversation_tones: Option<bool>,
    pub(crate) utc_offset_minutes: Option<i32>,
}

pub(crate) fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE);
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    match serde_json::from_slice::<AppConfig>(&bytes) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "ignoring malformed config");
            AppConfig::default()
        }
    }
}

impl AppConfig {
    pub(crate) fn store_path(&self, data_dir: &str) -> PathBuf {
        match self.store_path.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(p) => PathBuf::from(p),
            None => Path::new(data_dir).join(STORE_FILE),
        }
    }

    pub(crate) fn relay_url(&self) -> Option<&str> {
        self.relay_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub(crate) fn scheduler_interval_ms(&self) -> u64 {
        self.scheduler_interval_ms
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_SCHEDULER_INTERVAL_MS)
    }

    pub(crate) fn typing_idle_ms(&self) -> u64 {
        self.typing_idle_ms
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_TYPING_IDLE_MS)
    }

    pub(crate) fn snapshot_grace_ms(&self) -> i64 {
        self.snapshot_grace_ms.unwrap_or(DEFAULT_SNAPSHOT_GRACE_MS) as i64
    }

    pub(crate) fn conversation_tones(&self) -> bool {
        self.conversation_tones.unwrap_or(true)
    }
}

impl AppCore {
    pub(super) fn network_enabled(&self) -> bool {
        // Used to keep Rust tests deterministic and offline.
        if let Some(disable) = self.config.disable_network {
            return !disable;
        }
        std::env::var("COURIER_DISABLE_NETWORK").ok().as_deref() != Some("1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        let cfg = load_app_config(&data_dir);
        assert_eq!(cfg.scheduler_interval_ms(), 5_000);
        assert_eq!(cfg.typing_idle_ms(), 3_000);
        assert_eq!(cfg.snapshot_grace_ms(), 30_000);
        assert!(cfg.conversation_tones());
        assert_eq!(cfg.relay_url(), None);
        assert_eq!(cfg.store_path(&data_dir), dir.path().join("courier_store.sqlite3"));
    }

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"relay_url":" ws://127.0.0.1:5000 ","scheduler_interval_ms":250,"conversation_tones":false,"unknown":1}"#,
        )
        .unwrap();
        let cfg = load_app_config(&data_dir);
        assert_eq!(cfg.relay_url(), Some("ws://127.0.0.1:5000"));
        assert_eq!(cfg.scheduler_interval_ms(), 250);
        assert!(!cfg.conversation_tones());

        std::fs::write(dir.path().join(CONFIG_FILE), b"not json").unwrap();
        assert_eq!(load_app_config(&data_dir).scheduler_interval_ms(), 5_000);
    }
}
