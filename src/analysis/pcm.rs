//! Встроенный анализатор PCM
//!
//! Считает громкость (RMS и пик), долю речевых фреймов по WebRTC VAD,
//! долю энергии в речевой полосе 300-3400 Гц, клиппинг и динамический
//! диапазон по 20 мс фреймам.

use std::path::Path;
use async_trait::async_trait;
use log::{debug, warn};
use webrtc_vad::{SampleRate, Vad, VadMode};

use crate::analysis::{AudioQualityMetrics, QualityAssessor};
use crate::error::{DubSyncError, Result};
use crate::media::pcm::{amplitude_to_db, compute_rms, decode_audio_file};
use crate::segment::AudioClip;

const VAD_RATE: u32 = 16_000;
/// 30 мс при 16 кГц
const VAD_FRAME: usize = 480;
/// Минимальная доля речевых фреймов, чтобы считать, что голос есть
const MIN_VOICED_FRAME_RATIO: f64 = 0.1;
/// Доля энергии в речевой полосе, за которую даётся полный спектральный балл
const FULL_BAND_RATIO: f64 = 0.7;
/// Семпл считается клипнутым от этой амплитуды
const CLIP_LEVEL: f32 = 0.999;
/// Доля клипнутых семплов, после которой клип считается перегруженным
const CLIPPED_RATIO: f64 = 0.001;
/// Фреймы тише этого не участвуют в расчёте динамического диапазона
const DYNAMICS_FLOOR_DB: f64 = -70.0;

/// Подробный результат анализа
#[derive(Debug, Clone, Copy)]
pub struct PcmAnalysis {
    pub metrics: AudioQualityMetrics,
    pub voiced_ratio: f64,
    pub band_energy_ratio: f64,
    pub clipped_ratio: f64,
}

#[derive(Debug, Default, Clone)]
pub struct PcmAnalyzer;

impl PcmAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Проанализировать файл; ошибки чтения отдаются как `AnalysisFailure`
    pub async fn analyze(&self, path: &Path) -> Result<PcmAnalysis> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let buffer = decode_audio_file(&path)
                .map_err(|e| DubSyncError::AnalysisFailure(format!("{}: {}", path.display(), e)))?;
            if buffer.is_empty() {
                return Err(DubSyncError::AnalysisFailure(format!("{} has no samples", path.display())));
            }
            Ok(analyze_samples(&buffer.to_mono(), buffer.sample_rate))
        })
        .await
        .map_err(|e| DubSyncError::AnalysisFailure(format!("Analysis task panicked: {}", e)))?
    }
}

#[async_trait]
impl QualityAssessor for PcmAnalyzer {
    async fn assess(&self, clip: &AudioClip) -> AudioQualityMetrics {
        match self.analyze(&clip.path).await {
            Ok(analysis) => analysis.metrics,
            Err(e) => {
                warn!("Falling back to worst-case metrics: {}", e);
                AudioQualityMetrics::worst_case()
            }
        }
    }
}

/// Анализ моно-семплов
pub fn analyze_samples(samples: &[f32], sample_rate: u32) -> PcmAnalysis {
    let rms = compute_rms(samples);
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));

    let voiced_ratio = voiced_frame_ratio(samples, sample_rate);
    let band_energy_ratio = voice_band_ratio(samples, sample_rate);
    let clipped = samples.iter().filter(|s| s.abs() >= CLIP_LEVEL).count();
    let clipped_ratio = clipped as f64 / samples.len().max(1) as f64;

    let metrics = AudioQualityMetrics {
        has_voice: voiced_ratio >= MIN_VOICED_FRAME_RATIO,
        mean_volume_db: amplitude_to_db(rms),
        peak_volume_db: amplitude_to_db(peak),
        spectral_quality_score: (band_energy_ratio / FULL_BAND_RATIO * 100.0).clamp(0.0, 100.0),
        is_clipped: clipped_ratio > CLIPPED_RATIO,
        dynamic_range_db: dynamic_range(samples, sample_rate),
    };
    debug!(
        "Analysis: mean {:.1} dB, peak {:.1} dB, voiced {:.2}, band {:.2}",
        metrics.mean_volume_db, metrics.peak_volume_db, voiced_ratio, band_energy_ratio
    );

    PcmAnalysis { metrics, voiced_ratio, band_energy_ratio, clipped_ratio }
}

/// Линейная интерполяция до 16 кГц в i16 для VAD
fn to_vad_input(samples: &[f32], sample_rate: u32) -> Vec<i16> {
    let step = sample_rate as f64 / VAD_RATE as f64;
    let len = (samples.len() as f64 / step) as usize;
    (0..len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            let value = a + (b - a) * frac;
            (value.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
        })
        .collect()
}

/// Доля 30 мс фреймов, которые VAD считает речью
fn voiced_frame_ratio(samples: &[f32], sample_rate: u32) -> f64 {
    if samples.is_empty() || sample_rate == 0 {
        return 0.0;
    }
    let input = to_vad_input(samples, sample_rate);
    let mut vad = Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, VadMode::Quality);

    let mut total = 0usize;
    let mut voiced = 0usize;
    for frame in input.chunks_exact(VAD_FRAME) {
        total += 1;
        if let Ok(true) = vad.is_voice_segment(frame) {
            voiced += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    voiced as f64 / total as f64
}

/// Биквадратный фильтр (RBJ)
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    fn new(b: [f64; 3], a: [f64; 3]) -> Self {
        Self {
            b0: b[0] / a[0],
            b1: b[1] / a[0],
            b2: b[2] / a[0],
            a1: a[1] / a[0],
            a2: a[2] / a[0],
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    fn lowpass(cutoff: f64, sample_rate: f64) -> Self {
        let (cos, alpha) = Self::prewarp(cutoff, sample_rate);
        Self::new(
            [(1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    fn highpass(cutoff: f64, sample_rate: f64) -> Self {
        let (cos, alpha) = Self::prewarp(cutoff, sample_rate);
        Self::new(
            [(1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    fn prewarp(cutoff: f64, sample_rate: f64) -> (f64, f64) {
        let w0 = 2.0 * std::f64::consts::PI * cutoff / sample_rate;
        (w0.cos(), w0.sin() / (2.0 * std::f64::consts::FRAC_1_SQRT_2))
    }

    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2 - self.a1 * self.y1 - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Доля энергии в полосе 300-3400 Гц
fn voice_band_ratio(samples: &[f32], sample_rate: u32) -> f64 {
    let rate = sample_rate as f64;
    let total: f64 = samples.iter().map(|&s| (s as f64).powi(2)).sum();
    if total <= f64::EPSILON {
        return 0.0;
    }

    let mut highpass = Biquad::highpass(300.0, rate);
    let mut lowpass = (rate > 2.0 * 3400.0).then(|| Biquad::lowpass(3400.0, rate));
    let band: f64 = samples
        .iter()
        .map(|&s| {
            let mut y = highpass.process(s as f64);
            if let Some(lp) = lowpass.as_mut() {
                y = lp.process(y);
            }
            y * y
        })
        .sum();

    (band / total).clamp(0.0, 1.0)
}

/// Разница между 95-м и 10-м перцентилями громкости 20 мс фреймов
fn dynamic_range(samples: &[f32], sample_rate: u32) -> f64 {
    let frame = (sample_rate as usize / 50).max(1);
    let mut levels: Vec<f64> = samples
        .chunks(frame)
        .map(|chunk| amplitude_to_db(compute_rms(chunk)))
        .filter(|&db| db > DYNAMICS_FLOOR_DB)
        .collect();
    if levels.len() < 2 {
        return 0.0;
    }
    levels.sort_by(|a, b| a.total_cmp(b));
    let at = |q: f64| levels[((levels.len() - 1) as f64 * q).round() as usize];
    at(0.95) - at(0.10)
}
