//! Модуль конфигурации библиотеки dubsync
//!
//! Все константы калибровки (границы масштаба, пороги качества, расписание
//! затухания) вынесены сюда: они подбирались эмпирически и должны оставаться
//! настраиваемыми, а не зашитыми в код.

use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::error::{DubSyncError, Result};

/// Внешний движок синтеза речи
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EngineConfig {
    /// Локальная программа (piper и похожие): текст подаётся в stdin.
    /// В аргументах подставляются `{voice}`, `{length_scale}` и `{output}`.
    Command { program: String, args: Vec<String> },
    /// HTTP-сервис, принимающий JSON и возвращающий аудио
    Http { endpoint: String },
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::Command {
            program: "piper".to_string(),
            args: vec![
                "--model".to_string(),
                "{voice}".to_string(),
                "--length_scale".to_string(),
                "{length_scale}".to_string(),
                "--output_file".to_string(),
                "{output}".to_string(),
            ],
        }
    }
}

/// Настройки синтеза речи
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Движок синтеза
    pub engine: EngineConfig,
    /// Идентификатор голоса (модель piper, voice_id сервиса)
    pub voice: String,
    /// Жёсткий таймаут одного вызова синтеза в секундах
    pub timeout_secs: u64,
    /// Размер пула синтеза (обычно одна загруженная модель)
    pub max_concurrent: usize,
    /// Минимальный размер файла, который считается осмысленным клипом
    pub min_output_bytes: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            voice: "en_US-lessac-medium.onnx".to_string(),
            timeout_secs: 60,
            max_concurrent: 1,
            min_output_bytes: 1024,
        }
    }
}

/// Параметры калибровки сегментов и всего файла
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Нижняя граница масштаба длительности
    pub min_scale: f64,
    /// Верхняя граница масштаба длительности
    pub max_scale: f64,
    /// Стартовый глобальный масштаб, если кэш пуст
    pub initial_scale: f64,
    /// Максимум попыток синтеза на один сегмент
    pub max_retries: u32,
    /// Максимум итераций глобальной калибровки
    pub max_iterations: u32,
    /// Ниже этой средней громкости клип считается неслышимым
    pub min_audible_db: f64,
    /// Выше этой средней громкости дорожка считается перегретой
    pub too_hot_db: f64,
    /// Минимальная спектральная оценка для принятия клипа
    pub quality_floor: f64,
    /// Минимальная точность по длительности для принятия клипа, %
    pub precision_floor: f64,
    /// Целевая точность всей дорожки, %
    pub target_precision: f64,
    /// Целевое итоговое качество всей дорожки (0-100)
    pub quality_threshold: f64,
    /// Минимальная доля сегментов с голосом
    pub min_voice_ratio: f64,
    /// Затухание шага коррекции по номеру попытки
    pub damping: Vec<f64>,
    /// Вес нового значения при сглаживании, когда ошибка сменила знак
    pub smoothing: f64,
    /// Шаг изменения усиления, дБ
    pub boost_step_db: f64,
    /// Максимальное усиление, дБ
    pub max_boost_db: f64,
    /// Реплики короче этого считаются короткими
    pub short_duration_secs: f64,
    /// Множитель масштаба для коротких реплик
    pub short_duration_bias: f64,
    /// Реплики с таким или меньшим числом слов считаются короткими
    pub short_text_words: usize,
    /// Множитель масштаба для коротких текстов
    pub short_text_bias: f64,
    /// Пауза после каждых N сегментов (0 - без пауз)
    pub cooldown_every: usize,
    /// Длительность паузы в миллисекундах
    pub cooldown_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_scale: 0.5,
            max_scale: 2.0,
            initial_scale: 1.0,
            max_retries: 4,
            max_iterations: 3,
            min_audible_db: -45.0,
            too_hot_db: -8.0,
            quality_floor: 40.0,
            precision_floor: 85.0,
            target_precision: 95.0,
            quality_threshold: 70.0,
            min_voice_ratio: 0.8,
            damping: vec![0.5, 0.4, 0.3, 0.2],
            smoothing: 0.7,
            boost_step_db: 2.0,
            max_boost_db: 12.0,
            short_duration_secs: 1.5,
            short_duration_bias: 1.08,
            short_text_words: 2,
            short_text_bias: 1.05,
            cooldown_every: 0,
            cooldown_ms: 0,
        }
    }
}

impl CalibrationConfig {
    /// Ограничивает масштаб допустимым диапазоном
    pub fn clamp_scale(&self, scale: f64) -> f64 {
        if !scale.is_finite() {
            return self.initial_scale.clamp(self.min_scale, self.max_scale);
        }
        scale.clamp(self.min_scale, self.max_scale)
    }

    /// Коэффициент затухания для попытки с номером `attempt` (с единицы)
    pub fn damping_for(&self, attempt: u32) -> f64 {
        let idx = attempt.saturating_sub(1) as usize;
        self.damping
            .get(idx)
            .or_else(|| self.damping.last())
            .copied()
            .unwrap_or(0.5)
    }
}

/// Реализация транскодера
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranscoderKind {
    /// Встроенная обработка PCM (hound + rubato)
    Native,
    /// Внешний ffmpeg
    Ffmpeg,
}

impl Default for TranscoderKind {
    fn default() -> Self {
        Self::Native
    }
}

/// Реализация анализатора качества
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerKind {
    /// Встроенный анализ PCM
    Native,
    /// Громкость из ffmpeg volumedetect, остальное встроенным анализом
    Volumedetect,
}

impl Default for AnalyzerKind {
    fn default() -> Self {
        Self::Native
    }
}

/// Параметры сборки дорожки
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// Частота дискретизации всех фрагментов
    pub sample_rate: u32,
    /// Количество каналов всех фрагментов
    pub channels: u16,
    /// Паузы короче этого не вставляются, секунды
    pub gap_epsilon: f64,
    /// Запас после последней реплики, если длительность оригинала неизвестна
    pub trailing_pad_secs: f64,
    /// При такой точности клип не растягивается, %
    pub exact_fit_precision: f64,
    /// Минимальный коэффициент растяжения (цель / факт)
    pub min_stretch: f64,
    /// Максимальный коэффициент растяжения (цель / факт)
    pub max_stretch: f64,
    /// Финальная обработка громкости и шумоподавления
    pub polish: bool,
    /// Транскодер
    pub transcoder: TranscoderKind,
    /// Анализатор
    pub analyzer: AnalyzerKind,
    /// Таймаут одного вызова транскодера в секундах
    pub transcoder_timeout_secs: u64,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            gap_epsilon: 0.01,
            trailing_pad_secs: 0.5,
            exact_fit_precision: 99.0,
            min_stretch: 0.8,
            max_stretch: 1.25,
            polish: true,
            transcoder: TranscoderKind::default(),
            analyzer: AnalyzerKind::default(),
            transcoder_timeout_secs: 120,
        }
    }
}

/// Конфигурация библиотеки
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DubSyncConfig {
    /// Настройки синтеза
    pub synthesis: SynthesisConfig,
    /// Настройки калибровки
    pub calibration: CalibrationConfig,
    /// Настройки сборки
    pub assembly: AssemblyConfig,
    /// Файл кэша калибровки (без него тёплый старт не используется)
    pub cache_path: Option<PathBuf>,
    /// Рабочая директория для промежуточных клипов
    pub work_dir: Option<PathBuf>,
    /// Не удалять промежуточные клипы после завершения
    pub keep_artifacts: bool,
}

impl DubSyncConfig {
    /// Загрузить конфигурацию из JSON файла
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DubSyncError::FileNotFound(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let json = fs::read_to_string(path)?;
        let config: DubSyncConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Сохранить конфигурацию в JSON файл
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Проверить согласованность параметров
    pub fn validate(&self) -> Result<()> {
        let c = &self.calibration;
        if !(c.min_scale > 0.0 && c.min_scale <= c.max_scale) {
            return Err(DubSyncError::Configuration(format!(
                "Invalid scale bounds: min={} max={}",
                c.min_scale, c.max_scale
            )));
        }
        if c.damping.is_empty() {
            return Err(DubSyncError::Configuration("Damping schedule is empty".to_string()));
        }
        if c.max_retries == 0 || c.max_iterations == 0 {
            return Err(DubSyncError::Configuration(
                "max_retries and max_iterations must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&c.smoothing) {
            return Err(DubSyncError::Configuration(format!(
                "Smoothing must be within [0, 1], got {}",
                c.smoothing
            )));
        }
        if self.synthesis.max_concurrent == 0 {
            return Err(DubSyncError::Configuration(
                "Synthesis pool needs at least one permit".to_string(),
            ));
        }
        let a = &self.assembly;
        if a.sample_rate == 0 || a.channels == 0 {
            return Err(DubSyncError::Configuration(format!(
                "Invalid audio format: {} Hz, {} channels",
                a.sample_rate, a.channels
            )));
        }
        if !(a.min_stretch > 0.0 && a.min_stretch <= 1.0 && a.max_stretch >= 1.0) {
            return Err(DubSyncError::Configuration(format!(
                "Invalid stretch bounds: min={} max={}",
                a.min_stretch, a.max_stretch
            )));
        }
        Ok(())
    }
}
