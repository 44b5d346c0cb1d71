//! Модуль с моделью данных сегмента
//!
//! `TimedSegment` создаётся парсером один раз на реплику и изменяется только
//! калибратором сегмента, который им владеет в пределах одной итерации.

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use crate::analysis::AudioQualityMetrics;

/// Синтезированный аудиоклип на диске
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioClip {
    /// Путь к файлу
    pub path: PathBuf,
    /// Измеренная длительность в секундах
    pub duration: f64,
    /// Частота дискретизации
    pub sample_rate: u32,
    /// Количество каналов
    pub channels: u16,
}

impl AudioClip {
    /// Количество фреймов (семплов на канал)
    pub fn frames(&self) -> u64 {
        (self.duration * self.sample_rate as f64).round() as u64
    }
}

/// Состояние конечного автомата калибровки сегмента
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Pending,
    Rendering,
    Evaluating,
    Accepted,
    Retrying,
    Fallback,
}

/// Одна попытка синтеза сегмента
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleAttempt {
    /// Номер попытки, с единицы
    pub attempt: u32,
    /// Использованный масштаб длительности
    pub length_scale: f64,
    /// Измеренная длительность (None, если синтез не удался)
    pub measured_duration: Option<f64>,
    /// Точность по длительности, %
    pub precision: f64,
    /// Итоговое качество клипа
    pub quality_score: f64,
    /// Ошибка синтеза, если была
    pub error: Option<String>,
}

/// Реплика с таймингом и состоянием калибровки
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedSegment {
    /// Позиция реплики, с единицы
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    /// Исходный текст реплики
    pub raw_text: String,
    /// Текст, подготовленный для синтеза
    pub normalized_text: String,
    /// Текущий масштаб длительности
    pub length_scale: f64,
    pub attempt_count: u32,
    pub measured_duration: Option<f64>,
    /// Метрики последнего клипа
    pub quality: Option<AudioQualityMetrics>,
    pub scale_history: Vec<ScaleAttempt>,
    pub accepted: bool,
    pub state: SegmentState,
    /// Принятый клип; None означает подстановку тишины
    pub rendered_clip: Option<AudioClip>,
}

impl TimedSegment {
    pub fn new(index: usize, start_time: f64, end_time: f64, raw_text: String, normalized_text: String) -> Self {
        Self {
            index,
            start_time,
            end_time,
            duration: end_time - start_time,
            raw_text,
            normalized_text,
            length_scale: 1.0,
            attempt_count: 0,
            measured_duration: None,
            quality: None,
            scale_history: Vec::new(),
            accepted: false,
            state: SegmentState::Pending,
            rendered_clip: None,
        }
    }

    /// Сбросить изменяемые поля перед новой глобальной итерацией
    pub fn reset(&mut self, length_scale: f64) {
        self.length_scale = length_scale;
        self.attempt_count = 0;
        self.measured_duration = None;
        self.quality = None;
        self.scale_history.clear();
        self.accepted = false;
        self.state = SegmentState::Pending;
        self.rendered_clip = None;
    }

    /// Заменить реплику тишиной
    pub fn mark_fallback(&mut self) {
        self.state = SegmentState::Fallback;
        self.accepted = false;
        self.rendered_clip = None;
    }

    /// Количество слов в тексте для синтеза
    pub fn word_count(&self) -> usize {
        self.normalized_text.split_whitespace().count()
    }

    /// Сегмент будет заменён тишиной при сборке
    pub fn is_fallback(&self) -> bool {
        self.state == SegmentState::Fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_attempts() {
        let mut segment = TimedSegment::new(1, 1.0, 3.0, "Hello".into(), "Hello.".into());
        assert_eq!(segment.duration, 2.0);
        segment.attempt_count = 3;
        segment.accepted = true;
        segment.state = SegmentState::Accepted;
        segment.scale_history.push(ScaleAttempt {
            attempt: 1,
            length_scale: 1.0,
            measured_duration: Some(2.5),
            precision: 75.0,
            quality_score: 80.0,
            error: None,
        });

        segment.reset(0.9);
        assert_eq!(segment.length_scale, 0.9);
        assert_eq!(segment.attempt_count, 0);
        assert!(segment.scale_history.is_empty());
        assert_eq!(segment.state, SegmentState::Pending);
        assert!(!segment.accepted);
    }

    #[test]
    fn test_clip_frames() {
        let clip = AudioClip {
            path: PathBuf::from("a.wav"),
            duration: 1.5,
            sample_rate: 24_000,
            channels: 1,
        };
        assert_eq!(clip.frames(), 36_000);
    }
}
