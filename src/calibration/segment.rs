//! Калибратор сегмента
//!
//! Конечный автомат на одну реплику:
//! `Pending -> Rendering -> Evaluating -> {Accepted | Retrying | Fallback}`.
//! Ошибки синтеза и анализа поглощаются здесь и наружу не выходят: после
//! исчерпания попыток сегмент помечается для замены тишиной.

use log::{debug, info, warn};

use crate::analysis::{AudioQualityMetrics, QualityAssessor};
use crate::config::CalibrationConfig;
use crate::segment::{ScaleAttempt, SegmentState, TimedSegment};
use crate::tts::{SynthesisAdapter, SynthesisRequest};
use crate::utils::ArtifactStore;

/// Точность попадания в длительность, 0-100
pub fn precision(measured: f64, target: f64) -> f64 {
    if target <= 0.0 || !measured.is_finite() {
        return 0.0;
    }
    ((1.0 - (measured - target).abs() / target).max(0.0)) * 100.0
}

/// Критерий приёмки клипа
pub fn is_acceptable(metrics: &AudioQualityMetrics, precision: f64, config: &CalibrationConfig) -> bool {
    metrics.has_voice
        && metrics.mean_volume_db >= config.min_audible_db
        && metrics.spectral_quality_score >= config.quality_floor
        && precision >= config.precision_floor
}

/// Следующий масштаб после попытки номер `attempt`.
///
/// `history` содержит только предыдущие попытки. Если среди них есть
/// измеренная, масштаб ищется секущей через неё и текущую точку
/// `(масштаб, длительность)`. Когда секущая неприменима, шаг к отношению
/// `target / measured` затухает с номером попытки, а при смене знака ошибки
/// результат сглаживается к среднему двух последних масштабов.
pub fn next_scale(
    current: f64,
    target: f64,
    measured: f64,
    attempt: u32,
    history: &[ScaleAttempt],
    config: &CalibrationConfig,
) -> f64 {
    if measured <= 0.0 || target <= 0.0 {
        return config.clamp_scale(current);
    }
    let previous = history
        .iter()
        .rev()
        .find_map(|a| a.measured_duration.filter(|m| *m > 0.0).map(|m| (a.length_scale, m)));

    if let Some(next) = previous.and_then(|(scale, duration)| secant((scale, duration), (current, measured), target)) {
        return config.clamp_scale(next);
    }

    let ratio = target / measured;
    let mut next = current * (1.0 + (ratio - 1.0) * config.damping_for(attempt));
    if let Some((scale, duration)) = previous {
        if (duration - target).signum() != (measured - target).signum() {
            next = config.smoothing * next + (1.0 - config.smoothing) * (scale + current) / 2.0;
        }
    }
    config.clamp_scale(next)
}

/// Масштаб, при котором прямая через две точки `(масштаб, длительность)`
/// даёт `target`. None, если длительность не растёт с масштабом.
pub fn secant(earlier: (f64, f64), latest: (f64, f64), target: f64) -> Option<f64> {
    let slope = (latest.1 - earlier.1) / (latest.0 - earlier.0);
    (slope.is_finite() && slope > 0.0).then(|| latest.0 + (target - latest.1) / slope)
}

/// Стартовый масштаб сегмента: глобальный с поправкой на короткие реплики
pub fn initial_scale(global_scale: f64, segment: &TimedSegment, config: &CalibrationConfig) -> f64 {
    let mut scale = global_scale;
    // короткие реплики стартуют с увеличенным масштабом
    if segment.duration < config.short_duration_secs {
        scale *= config.short_duration_bias;
    }
    if segment.word_count() <= config.short_text_words {
        scale *= config.short_text_bias;
    }
    config.clamp_scale(scale)
}

/// Калибратор одного сегмента
pub struct SegmentCalibrator<'a> {
    adapter: &'a SynthesisAdapter,
    assessor: &'a dyn QualityAssessor,
    artifacts: &'a ArtifactStore,
    config: &'a CalibrationConfig,
    voice: &'a str,
}

impl<'a> SegmentCalibrator<'a> {
    pub fn new(
        adapter: &'a SynthesisAdapter,
        assessor: &'a dyn QualityAssessor,
        artifacts: &'a ArtifactStore,
        config: &'a CalibrationConfig,
        voice: &'a str,
    ) -> Self {
        Self { adapter, assessor, artifacts, config, voice }
    }

    fn transition(segment: &mut TimedSegment, state: SegmentState) {
        debug!("Segment {}: {:?} -> {:?}", segment.index, segment.state, state);
        segment.state = state;
    }

    /// Довести сегмент до `Accepted` или `Fallback`
    pub async fn calibrate(&self, segment: &mut TimedSegment, iteration: u32) {
        Self::transition(segment, SegmentState::Pending);

        loop {
            Self::transition(segment, SegmentState::Rendering);
            segment.attempt_count += 1;
            let attempt = segment.attempt_count;
            let scale = segment.length_scale;

            let request = SynthesisRequest {
                text: segment.normalized_text.clone(),
                length_scale: scale,
                voice: self.voice.to_string(),
            };
            let rendered = match self.artifacts.attempt_path(iteration, segment.index, attempt) {
                Ok(path) => self.adapter.synthesize(&request, &path).await,
                Err(e) => Err(e),
            };

            match rendered {
                Ok(clip) => {
                    Self::transition(segment, SegmentState::Evaluating);
                    let metrics = self.assessor.assess(&clip).await;
                    let precision = precision(clip.duration, segment.duration);
                    let quality = metrics.overall_quality();
                    info!(
                        "Segment {} try {}: scale {:.3}, {:.2}s for {:.2}s slot, precision {:.1}%, quality {:.0}",
                        segment.index, attempt, scale, clip.duration, segment.duration, precision, quality
                    );

                    segment.measured_duration = Some(clip.duration);
                    segment.quality = Some(metrics);
                    let earlier = segment.scale_history.len();
                    segment.scale_history.push(ScaleAttempt {
                        attempt,
                        length_scale: scale,
                        measured_duration: Some(clip.duration),
                        precision,
                        quality_score: quality,
                        error: None,
                    });

                    if is_acceptable(&metrics, precision, self.config) {
                        Self::transition(segment, SegmentState::Accepted);
                        segment.accepted = true;
                        segment.rendered_clip = Some(clip);
                        return;
                    }

                    if attempt >= self.config.max_retries {
                        break;
                    }
                    segment.length_scale = next_scale(
                        scale,
                        segment.duration,
                        clip.duration,
                        attempt,
                        &segment.scale_history[..earlier],
                        self.config,
                    );
                }
                Err(e) => {
                    warn!("Segment {} try {} failed: {}", segment.index, attempt, e);
                    segment.scale_history.push(ScaleAttempt {
                        attempt,
                        length_scale: scale,
                        measured_duration: None,
                        precision: 0.0,
                        quality_score: 0.0,
                        error: Some(e.to_string()),
                    });
                    if attempt >= self.config.max_retries {
                        break;
                    }
                }
            }
            Self::transition(segment, SegmentState::Retrying);
        }

        warn!(
            "Segment {} ({:.2}s) failed after {} attempts, substituting silence: {:?}",
            segment.index, segment.duration, segment.attempt_count, segment.normalized_text
        );
        Self::transition(segment, SegmentState::Fallback);
        segment.mark_fallback();
    }
}
