//! Модуль кэша калибровки
//!
//! Плоский JSON `ключ -> число`. Ключи имеют префикс конвейера (md5 от
//! движка, голоса и формата), так что в одном файле уживаются разные
//! голоса. Отсутствие или порча файла не фатальны: используется холодный старт.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use log::{info, warn};

use crate::calibration::state::CalibrationState;
use crate::config::CalibrationConfig;
use crate::error::Result;

const SCALE_KEY: &str = "global_length_scale";
const COMPENSATION_KEY: &str = "silence_compensation";
const BOOST_KEY: &str = "dynamic_boost_db";

/// Кэш параметров калибровки
pub struct CalibrationCache {
    path: PathBuf,
    pipeline: String,
}

/// Ключ конвейера: одинаковые движок, голос и формат дают один ключ
pub fn pipeline_key(engine: &str, voice: &str, sample_rate: u32, channels: u16) -> String {
    let mut hasher = md5::Context::new();
    hasher.consume(engine.as_bytes());
    hasher.consume(b"|");
    hasher.consume(voice.as_bytes());
    hasher.consume(format!("|{}|{}", sample_rate, channels).as_bytes());
    format!("{:x}", hasher.compute())
}

impl CalibrationCache {
    pub fn new(path: impl Into<PathBuf>, pipeline: impl Into<String>) -> Self {
        Self { path: path.into(), pipeline: pipeline.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key(&self, name: &str) -> String {
        format!("{}.{}", self.pipeline, name)
    }

    fn read_map(&self) -> Option<BTreeMap<String, f64>> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No calibration cache at {}, cold start", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read calibration cache {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(map) => Some(map),
            Err(e) => {
                warn!("Ignoring corrupt calibration cache {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Загрузить состояние; при любой проблеме - холодный старт
    pub fn load(&self, config: &CalibrationConfig) -> CalibrationState {
        let Some(map) = self.read_map() else {
            return CalibrationState::new(config);
        };
        let Some(&scale) = map.get(&self.key(SCALE_KEY)) else {
            info!("Calibration cache has no entry for this pipeline, cold start");
            return CalibrationState::new(config);
        };
        let compensation = map.get(&self.key(COMPENSATION_KEY)).copied().unwrap_or(0.0);
        let boost = map.get(&self.key(BOOST_KEY)).copied().unwrap_or(0.0);

        let state = CalibrationState::from_saved(config, scale, compensation, boost);
        info!(
            "Warm start: scale {:.3}, boost {:.1} dB",
            state.global_length_scale(),
            state.dynamic_boost_db()
        );
        state
    }

    /// Перезаписать значения этого конвейера
    pub fn save(&self, state: &CalibrationState) -> Result<()> {
        let mut map = self.read_map().unwrap_or_default();
        map.insert(self.key(SCALE_KEY), state.global_length_scale());
        map.insert(self.key(COMPENSATION_KEY), state.silence_compensation);
        map.insert(self.key(BOOST_KEY), state.dynamic_boost_db());

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&map)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
