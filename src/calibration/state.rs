//! Состояние глобальной калибровки
//!
//! Живёт один прогон, изменяется только глобальным калибратором. Сеттеры
//! держат инварианты: масштаб в [min_scale, max_scale], усиление в
//! [0, max_boost_db].

use serde::{Deserialize, Serialize};

use crate::config::CalibrationConfig;

/// Итог одной итерации
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub scale: f64,
    pub boost_db: f64,
    pub final_duration: f64,
    pub target_duration: f64,
    pub precision: f64,
    pub quality_score: f64,
    pub voice_segment_ratio: f64,
    pub fallback_segments: usize,
    /// Отношение слотов к речи при масштабе итерации
    #[serde(default)]
    pub duration_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationState {
    global_length_scale: f64,
    /// Доля таймлайна, которую сборщику пришлось заполнить или обрезать
    pub silence_compensation: f64,
    dynamic_boost_db: f64,
    pub iteration_history: Vec<IterationRecord>,
    #[serde(skip)]
    bounds: ScaleBounds,
}

#[derive(Debug, Clone, Copy)]
struct ScaleBounds {
    min_scale: f64,
    max_scale: f64,
    max_boost_db: f64,
}

impl Default for ScaleBounds {
    fn default() -> Self {
        let config = CalibrationConfig::default();
        Self {
            min_scale: config.min_scale,
            max_scale: config.max_scale,
            max_boost_db: config.max_boost_db,
        }
    }
}

impl CalibrationState {
    /// Холодный старт
    pub fn new(config: &CalibrationConfig) -> Self {
        let mut state = Self {
            global_length_scale: config.initial_scale,
            silence_compensation: 0.0,
            dynamic_boost_db: 0.0,
            iteration_history: Vec::new(),
            bounds: ScaleBounds {
                min_scale: config.min_scale,
                max_scale: config.max_scale,
                max_boost_db: config.max_boost_db,
            },
        };
        state.set_global_length_scale(config.initial_scale);
        state
    }

    /// Тёплый старт из сохранённых значений
    pub fn from_saved(config: &CalibrationConfig, scale: f64, silence_compensation: f64, boost_db: f64) -> Self {
        let mut state = Self::new(config);
        state.set_global_length_scale(scale);
        state.set_dynamic_boost_db(boost_db);
        if silence_compensation.is_finite() {
            state.silence_compensation = silence_compensation;
        }
        state
    }

    pub fn global_length_scale(&self) -> f64 {
        self.global_length_scale
    }

    pub fn set_global_length_scale(&mut self, scale: f64) {
        self.global_length_scale = if scale.is_finite() {
            scale.clamp(self.bounds.min_scale, self.bounds.max_scale)
        } else {
            self.global_length_scale.clamp(self.bounds.min_scale, self.bounds.max_scale)
        };
    }

    pub fn dynamic_boost_db(&self) -> f64 {
        self.dynamic_boost_db
    }

    pub fn set_dynamic_boost_db(&mut self, boost_db: f64) {
        self.dynamic_boost_db = if boost_db.is_finite() {
            boost_db.clamp(0.0, self.bounds.max_boost_db)
        } else {
            0.0
        };
    }

    pub fn record(&mut self, record: IterationRecord) {
        self.iteration_history.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariants_hold() {
        let config = CalibrationConfig::default();
        let mut state = CalibrationState::new(&config);
        assert_eq!(state.global_length_scale(), 1.0);

        state.set_global_length_scale(10.0);
        assert_eq!(state.global_length_scale(), config.max_scale);
        state.set_global_length_scale(f64::NAN);
        assert_eq!(state.global_length_scale(), config.max_scale);

        state.set_dynamic_boost_db(100.0);
        assert_eq!(state.dynamic_boost_db(), config.max_boost_db);
        state.set_dynamic_boost_db(-3.0);
        assert_eq!(state.dynamic_boost_db(), 0.0);
    }

    #[test]
    fn test_warm_start_is_clamped() {
        let config = CalibrationConfig::default();
        let state = CalibrationState::from_saved(&config, 0.1, 0.02, 4.0);
        assert_eq!(state.global_length_scale(), config.min_scale);
        assert_eq!(state.dynamic_boost_db(), 4.0);
        assert_eq!(state.silence_compensation, 0.02);
    }
}
