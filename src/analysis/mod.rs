//! Модуль оценки качества аудио
//!
//! `QualityAssessor::assess` никогда не возвращает ошибку: при любом сбое
//! анализа отдаётся наихудший вариант метрик, чтобы калибратору всегда
//! было на что опереться.

pub mod pcm;
pub mod volumedetect;

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AnalyzerKind, AssemblyConfig};
use crate::error::Result;
use crate::segment::AudioClip;

pub use pcm::PcmAnalyzer;
pub use volumedetect::VolumeDetectAnalyzer;

/// Границы "нормальной" средней громкости для оценки, dBFS
const VOLUME_GOOD_LOW_DB: f64 = -35.0;
const VOLUME_GOOD_HIGH_DB: f64 = -10.0;
/// Ниже этой громкости оценка за громкость нулевая
const VOLUME_FLOOR_DB: f64 = -60.0;
/// Динамический диапазон, за который даётся полный балл
const FULL_DYNAMIC_RANGE_DB: f64 = 20.0;

/// Метрики качества клипа или всей дорожки
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioQualityMetrics {
    pub has_voice: bool,
    pub mean_volume_db: f64,
    pub peak_volume_db: f64,
    /// 0-100
    pub spectral_quality_score: f64,
    pub is_clipped: bool,
    pub dynamic_range_db: f64,
}

impl AudioQualityMetrics {
    /// Наихудшие метрики для неудавшегося анализа
    pub fn worst_case() -> Self {
        Self {
            has_voice: false,
            mean_volume_db: -90.0,
            peak_volume_db: -90.0,
            spectral_quality_score: 0.0,
            is_clipped: false,
            dynamic_range_db: 0.0,
        }
    }

    /// Взвешенная оценка 0-100: голос 30, громкость 25, спектр 20,
    /// отсутствие клиппинга 15, динамический диапазон 10
    pub fn overall_quality(&self) -> f64 {
        let voice = if self.has_voice { 30.0 } else { 0.0 };
        let volume = 25.0 * volume_in_range(self.mean_volume_db);
        let spectral = 20.0 * (self.spectral_quality_score / 100.0).clamp(0.0, 1.0);
        let clipping = if self.is_clipped { 0.0 } else { 15.0 };
        let dynamics = 10.0 * (self.dynamic_range_db / FULL_DYNAMIC_RANGE_DB).clamp(0.0, 1.0);
        voice + volume + spectral + clipping + dynamics
    }
}

/// Доля балла за громкость: 1 в коридоре, линейный спад за его пределами
fn volume_in_range(mean_db: f64) -> f64 {
    if mean_db < VOLUME_GOOD_LOW_DB {
        ((mean_db - VOLUME_FLOOR_DB) / (VOLUME_GOOD_LOW_DB - VOLUME_FLOOR_DB)).clamp(0.0, 1.0)
    } else if mean_db > VOLUME_GOOD_HIGH_DB {
        (-mean_db / -VOLUME_GOOD_HIGH_DB).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Анализатор качества клипа
#[async_trait]
pub trait QualityAssessor: Send + Sync {
    /// Оценить клип, не изменяя его
    async fn assess(&self, clip: &AudioClip) -> AudioQualityMetrics;
}

/// Создать анализатор по конфигурации
pub fn create_assessor(config: &AssemblyConfig) -> Result<Arc<dyn QualityAssessor>> {
    match config.analyzer {
        AnalyzerKind::Native => Ok(Arc::new(PcmAnalyzer::new())),
        AnalyzerKind::Volumedetect => Ok(Arc::new(VolumeDetectAnalyzer::new(
            PcmAnalyzer::new(),
            Duration::from_secs(config.transcoder_timeout_secs),
        )?)),
    }
}
