//! Модуль для работы с аудио
//!
//! Граница транскодирования: генерация тишины точной длины, склейка,
//! ограниченное растяжение по времени и финальная обработка громкости.
//! Все операции работают с файлами одного формата, согласованного на старте.

pub mod ffmpeg;
pub mod native;
pub mod pcm;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;

use crate::config::{AssemblyConfig, TranscoderKind};
use crate::error::Result;
use crate::segment::AudioClip;

pub use ffmpeg::FfmpegTranscoder;
pub use native::NativeTranscoder;
pub use pcm::PcmBuffer;

/// Формат всех фрагментов дорожки
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Количество фреймов для длительности, с округлением до ближайшего
    pub fn frames_for(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }

    pub fn seconds_for(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64
    }
}

/// Операции над аудиофайлами, нужные сборщику
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Формат, в котором транскодер выдаёт все файлы
    fn format(&self) -> AudioFormat;

    /// Тишина ровно из `frames` фреймов
    async fn silence(&self, frames: u64, output: &Path) -> Result<AudioClip>;

    /// Привести клип к формату дорожки
    async fn conform(&self, input: &Path, output: &Path) -> Result<AudioClip>;

    /// Растянуть или сжать клип ровно до `frames` фреймов
    async fn time_stretch(&self, input: &Path, frames: u64, output: &Path) -> Result<AudioClip>;

    /// Обрезать или дополнить тишиной ровно до `frames` фреймов
    async fn fit(&self, input: &Path, frames: u64, output: &Path) -> Result<AudioClip>;

    /// Склеить клипы одного формата в заданном порядке
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<AudioClip>;

    /// Усиление, шумоподавление и лимитер; длина не меняется
    async fn polish(&self, input: &Path, boost_db: f64, output: &Path) -> Result<AudioClip>;
}

/// Измерить WAV клип по заголовку
pub fn probe_wav(path: &Path) -> Result<AudioClip> {
    let (duration, sample_rate, channels) = pcm::wav_duration(path)?;
    Ok(AudioClip {
        path: path.to_path_buf(),
        duration,
        sample_rate,
        channels,
    })
}

/// Создать транскодер по конфигурации
pub fn create_transcoder(config: &AssemblyConfig) -> Result<Arc<dyn Transcoder>> {
    let format = AudioFormat {
        sample_rate: config.sample_rate,
        channels: config.channels,
    };
    match config.transcoder {
        TranscoderKind::Native => Ok(Arc::new(NativeTranscoder::new(format))),
        TranscoderKind::Ffmpeg => Ok(Arc::new(FfmpegTranscoder::new(
            format,
            std::time::Duration::from_secs(config.transcoder_timeout_secs),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_rounding() {
        let format = AudioFormat { sample_rate: 24_000, channels: 1 };
        assert_eq!(format.frames_for(1.0), 24_000);
        assert_eq!(format.frames_for(0.00002), 0);
        assert_eq!(format.frames_for(0.00003), 1);
        assert_eq!(format.frames_for(-1.0), 0);
        assert!((format.seconds_for(36_000) - 1.5).abs() < 1e-12);
    }
}
