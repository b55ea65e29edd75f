use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectorConfig {
    pub background_task_identifier: String,
    pub sample_rate_hz: u32,
    /// Readings buffered by the sink before a batch commit.
    pub save_threshold: usize,
    pub export_page_size: usize,
    pub window_capacity: usize,
    /// Samples between classifier calls once the window is full.
    pub inference_stride: usize,
    pub liveness_interval_ms: u64,
    pub event_buffer: usize,
    pub export_dir: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            background_task_identifier: "com.motioncollector.task.process".into(),
            sample_rate_hz: 50,
            save_threshold: 500,
            export_page_size: 1000,
            window_capacity: 60,
            inference_stride: 60,
            liveness_interval_ms: 1000,
            event_buffer: 1024,
            export_dir: None,
            model_path: None,
        }
    }
}

impl CollectorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.sample_rate_hz.max(1)))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.max(1))
    }

    pub fn export_dir_or(&self, data_dir: &Path) -> PathBuf {
        self.export_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("exports"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_hz == 0 {
            bail!("sampleRateHz must be greater than zero");
        }
        if self.save_threshold == 0 {
            bail!("saveThreshold must be greater than zero");
        }
        if self.export_page_size == 0 {
            bail!("exportPageSize must be greater than zero");
        }
        if self.window_capacity == 0 || self.inference_stride == 0 {
            bail!("windowCapacity and inferenceStride must be greater than zero");
        }
        if self.event_buffer == 0 {
            bail!("eventBuffer must be greater than zero");
        }
        if self.background_task_identifier.trim().is_empty() {
            bail!("backgroundTaskIdentifier must not be empty");
        }
        Ok(())
    }
}

/// `MOTION_COLLECTOR_DEBUG=1|true` makes every liveness beat log.
pub fn debug_mode() -> bool {
    std::env::var("MOTION_COLLECTOR_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<CollectorConfig>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            match serde_json::from_str::<CollectorConfig>(&contents) {
                Ok(config) if config.validate().is_ok() => config,
                Ok(_) | Err(_) => {
                    warn!(
                        "Ignoring invalid config at {}, using defaults",
                        path.display()
                    );
                    CollectorConfig::default()
                }
            }
        } else {
            CollectorConfig::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn config(&self) -> CollectorConfig {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, config: CollectorConfig) -> Result<()> {
        config.validate()?;
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.persist(&config)?;
        *guard = config;
        Ok(())
    }

    fn persist(&self, data: &CollectorConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write config to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_collection_constants() {
        let config = CollectorConfig::default();
        assert_eq!(config.sample_interval(), Duration::from_millis(20));
        assert_eq!(config.save_threshold, 500);
        assert_eq!(config.window_capacity, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json")).unwrap();
        assert_eq!(store.config(), CollectorConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "sampleRateHz": 20, "saveThreshold": 100 }"#).unwrap();

        let config = ConfigStore::new(path).unwrap().config();
        assert_eq!(config.sample_rate_hz, 20);
        assert_eq!(config.save_threshold, 100);
        assert_eq!(config.export_page_size, 1000);
    }

    #[test]
    fn test_garbage_or_invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert_eq!(
            ConfigStore::new(path.clone()).unwrap().config(),
            CollectorConfig::default()
        );

        fs::write(&path, r#"{ "sampleRateHz": 0 }"#).unwrap();
        assert_eq!(
            ConfigStore::new(path).unwrap().config(),
            CollectorConfig::default()
        );
    }

    #[test]
    fn test_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let store = ConfigStore::new(path.clone()).unwrap();

        let mut config = store.config();
        config.window_capacity = 120;
        store.update(config.clone()).unwrap();

        assert_eq!(ConfigStore::new(path).unwrap().config(), config);
    }

    #[test]
    fn test_update_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json")).unwrap();

        let mut config = store.config();
        config.inference_stride = 0;
        assert!(store.update(config).is_err());
        assert_eq!(store.config().inference_stride, 60);
    }
}
