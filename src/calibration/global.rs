//! Глобальный калибратор
//!
//! Итерации над всем файлом: калибровка сегментов, сборка, оценка дорожки
//! и подстройка глобального масштаба и усиления. Лучший по качеству
//! кандидат становится результатом, если ни одна итерация не прошла порог.

use std::path::Path;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::analysis::{AudioQualityMetrics, QualityAssessor};
use crate::assembly::{Assembler, AssemblyOutcome};
use crate::calibration::cache::CalibrationCache;
use crate::calibration::segment::{initial_scale, precision, secant, SegmentCalibrator};
use crate::calibration::state::{CalibrationState, IterationRecord};
use crate::config::{AssemblyConfig, CalibrationConfig};
use crate::error::{DubSyncError, Result};
use crate::media::{probe_wav, Transcoder};
use crate::progress::{send_progress, ProgressUpdate};
use crate::segment::{AudioClip, TimedSegment};
use crate::tts::SynthesisAdapter;
use crate::utils::ArtifactStore;

/// Точность сегментов, взвешенная по длительности; считаются только принятые
pub fn segment_precision(segments: &[TimedSegment]) -> f64 {
    let (weighted, total) = segments
        .iter()
        .filter(|s| s.accepted)
        .filter_map(|s| s.measured_duration.map(|m| (precision(m, s.duration), s.duration)))
        .fold((0.0, 0.0), |(w, t), (p, d)| (w + p * d, t + d));
    if total > 0.0 { weighted / total } else { 0.0 }
}

/// Доля сегментов, принятых с голосом
pub fn voice_segment_ratio(segments: &[TimedSegment]) -> f64 {
    if segments.is_empty() {
        return 0.0;
    }
    let voiced = segments
        .iter()
        .filter(|s| s.accepted && s.quality.map_or(false, |q| q.has_voice))
        .count();
    voiced as f64 / segments.len() as f64
}

/// Отношение суммарной длительности слотов к длительности речи на
/// стартовых масштабах итерации.
///
/// Берётся первая удачная попытка сегмента, её длительность приводится к
/// стартовому масштабу сегмента.
pub fn duration_ratio(segments: &[TimedSegment]) -> Option<f64> {
    let mut slots = 0.0;
    let mut rendered = 0.0;
    for segment in segments {
        let Some(initial) = segment.scale_history.first().map(|a| a.length_scale) else {
            continue;
        };
        let first_ok = segment
            .scale_history
            .iter()
            .find_map(|a| a.measured_duration.map(|m| (m, a.length_scale)));
        if let Some((measured, scale)) = first_ok {
            if scale > 0.0 && measured > 0.0 {
                slots += segment.duration;
                rendered += measured * initial / scale;
            }
        }
    }
    (rendered > 0.0).then(|| slots / rendered)
}

/// Новый глобальный масштаб по отношению `target / measured` для файла.
///
/// `history` содержит только предыдущие итерации. Правило то же, что у
/// сегмента: секущая по нагрузке `1 / ratio` через предыдущую итерацию,
/// иначе затухающий шаг со сглаживанием при смене знака ошибки.
pub fn next_global_scale(
    current: f64,
    ratio: f64,
    iteration: u32,
    history: &[IterationRecord],
    config: &CalibrationConfig,
) -> f64 {
    if !ratio.is_finite() || ratio <= 0.0 {
        return config.clamp_scale(current);
    }
    let load = 1.0 / ratio;
    let previous = history.iter().rev().find_map(|r| {
        r.duration_ratio
            .filter(|x| x.is_finite() && *x > 0.0)
            .map(|x| (r.scale, 1.0 / x))
    });

    if let Some(next) = previous.and_then(|p| secant(p, (current, load), 1.0)) {
        return config.clamp_scale(next);
    }

    let mut next = current * (1.0 + (ratio - 1.0) * config.damping_for(iteration));
    if let Some((scale, previous_load)) = previous {
        if (previous_load - 1.0).signum() != (load - 1.0).signum() {
            next = config.smoothing * next + (1.0 - config.smoothing) * (scale + current) / 2.0;
        }
    }
    config.clamp_scale(next)
}

/// Новое усиление по средней громкости дорожки
pub fn next_boost(current: f64, mean_volume_db: f64, config: &CalibrationConfig) -> f64 {
    let next = if mean_volume_db < config.min_audible_db {
        current + config.boost_step_db
    } else if mean_volume_db > config.too_hot_db {
        current - config.boost_step_db
    } else {
        current
    };
    next.clamp(0.0, config.max_boost_db)
}

/// Кандидат одной итерации
struct Candidate {
    iteration: u32,
    track: AudioClip,
    metrics: AudioQualityMetrics,
    precision: f64,
    quality: f64,
    voice_ratio: f64,
    segments: Vec<TimedSegment>,
    assembly: AssemblyOutcome,
}

impl Candidate {
    fn beats(&self, other: &Candidate) -> bool {
        self.quality > other.quality || (self.quality == other.quality && self.precision > other.precision)
    }
}

/// Результат прогона
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Итоговая дорожка, уже скопированная в выходной путь
    pub track: AudioClip,
    pub metrics: AudioQualityMetrics,
    pub precision: f64,
    pub quality: f64,
    pub voice_ratio: f64,
    pub best_iteration: u32,
    pub iterations_run: u32,
    /// Прошла ли какая-то итерация все пороги
    pub converged: bool,
    /// Сегменты лучшей итерации
    pub segments: Vec<TimedSegment>,
    pub assembly: AssemblyOutcome,
    pub state: CalibrationState,
}

pub struct GlobalCalibrator<'a> {
    adapter: &'a SynthesisAdapter,
    assessor: &'a dyn QualityAssessor,
    transcoder: &'a dyn Transcoder,
    artifacts: &'a ArtifactStore,
    calibration: &'a CalibrationConfig,
    assembly: &'a AssemblyConfig,
    voice: &'a str,
    cache: Option<&'a CalibrationCache>,
    progress: Option<Sender<ProgressUpdate>>,
    cancel: CancellationToken,
}

impl<'a> GlobalCalibrator<'a> {
    pub fn new(
        adapter: &'a SynthesisAdapter,
        assessor: &'a dyn QualityAssessor,
        transcoder: &'a dyn Transcoder,
        artifacts: &'a ArtifactStore,
        calibration: &'a CalibrationConfig,
        assembly: &'a AssemblyConfig,
        voice: &'a str,
    ) -> Self {
        Self {
            adapter,
            assessor,
            transcoder,
            artifacts,
            calibration,
            assembly,
            voice,
            cache: None,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cache(mut self, cache: &'a CalibrationCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_progress(mut self, progress: Option<Sender<ProgressUpdate>>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Откалибровать все сегменты итерации в порядке реплик
    async fn calibrate_segments(&self, segments: &mut [TimedSegment], iteration: u32) {
        let calibrator = SegmentCalibrator::new(self.adapter, self.assessor, self.artifacts, self.calibration, self.voice);
        let calibrator = &calibrator;
        let total = segments.len();
        let chunk_size = match self.calibration.cooldown_every {
            0 => total.max(1),
            n => n,
        };
        let workers = self.adapter.max_concurrent().max(1);

        let mut chunks = segments.chunks_mut(chunk_size).peekable();
        while let Some(chunk) = chunks.next() {
            stream::iter(chunk.iter_mut().map(|segment| async move {
                if self.cancel.is_cancelled() {
                    return;
                }
                calibrator.calibrate(segment, iteration).await;
                send_progress(
                    &self.progress,
                    ProgressUpdate::SegmentFinished {
                        index: segment.index,
                        total,
                        accepted: segment.accepted,
                        attempts: segment.attempt_count,
                    },
                )
                .await;
            }))
            .buffered(workers)
            .collect::<Vec<()>>()
            .await;

            if chunks.peek().is_some() && self.calibration.cooldown_ms > 0 && !self.cancel.is_cancelled() {
                debug!("Cooling down synthesis for {} ms", self.calibration.cooldown_ms);
                tokio::time::sleep(std::time::Duration::from_millis(self.calibration.cooldown_ms)).await;
            }
        }
    }

    fn check_cancelled(&self, iteration: u32) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!("Run cancelled during iteration {}, discarding its artifacts", iteration);
            self.artifacts.discard_iteration(iteration);
            return Err(DubSyncError::Cancelled);
        }
        Ok(())
    }

    /// Выполнить прогон и записать лучшую дорожку в `output`
    pub async fn run(
        &self,
        template: &[TimedSegment],
        target_duration: f64,
        mut state: CalibrationState,
        output: &Path,
    ) -> Result<RunOutcome> {
        if template.is_empty() {
            return Err(DubSyncError::AssemblyEmpty);
        }
        let max_iterations = self.calibration.max_iterations.max(1);
        let mut best: Option<Candidate> = None;
        let mut converged = false;
        let mut iterations_run = 0;

        for iteration in 1..=max_iterations {
            self.check_cancelled(iteration)?;
            iterations_run = iteration;
            info!(
                "Iteration {}/{}: global scale {:.3}, boost {:.1} dB",
                iteration,
                max_iterations,
                state.global_length_scale(),
                state.dynamic_boost_db()
            );
            send_progress(
                &self.progress,
                ProgressUpdate::IterationStarted {
                    iteration,
                    max_iterations,
                    global_scale: state.global_length_scale(),
                },
            )
            .await;

            let mut segments = template.to_vec();
            for segment in segments.iter_mut() {
                segment.reset(initial_scale(state.global_length_scale(), segment, self.calibration));
            }

            self.calibrate_segments(&mut segments, iteration).await;
            self.check_cancelled(iteration)?;

            send_progress(&self.progress, ProgressUpdate::Assembling { iteration }).await;
            let candidate_path = self.artifacts.piece_path(iteration, "track.wav")?;
            let assembler = Assembler::new(self.transcoder, self.assembly, self.artifacts);
            let assembly = assembler
                .assemble(&segments, target_duration, state.dynamic_boost_db(), iteration, &candidate_path)
                .await?;

            for segment in segments.iter_mut().filter(|s| assembly.failed_segments.contains(&s.index)) {
                segment.mark_fallback();
            }

            let metrics = self.assessor.assess(&assembly.track).await;
            let track_precision = precision(assembly.track.duration, target_duration);
            let precision = track_precision.min(segment_precision(&segments));
            let quality = metrics.overall_quality();
            let voice_ratio = voice_segment_ratio(&segments);
            let fallback_segments = segments.iter().filter(|s| s.is_fallback()).count();
            let ratio = duration_ratio(&segments);

            info!(
                "Iteration {} result: {:.3}s of {:.3}s, precision {:.1}%, quality {:.1}, voiced {:.0}%, {} fallback",
                iteration,
                assembly.track.duration,
                target_duration,
                precision,
                quality,
                voice_ratio * 100.0,
                fallback_segments
            );
            send_progress(&self.progress, ProgressUpdate::IterationFinished { iteration, precision, quality }).await;

            let earlier = state.iteration_history.len();
            state.record(IterationRecord {
                iteration,
                scale: state.global_length_scale(),
                boost_db: state.dynamic_boost_db(),
                final_duration: assembly.track.duration,
                target_duration,
                precision,
                quality_score: quality,
                voice_segment_ratio: voice_ratio,
                fallback_segments,
                duration_ratio: ratio,
            });
            state.silence_compensation = assembly.silence_compensation();

            let accepted = precision >= self.calibration.target_precision
                && quality >= self.calibration.quality_threshold
                && voice_ratio >= self.calibration.min_voice_ratio;

            if !accepted && iteration < max_iterations {
                if let Some(ratio) = ratio {
                    let next = next_global_scale(
                        state.global_length_scale(),
                        ratio,
                        iteration,
                        &state.iteration_history[..earlier],
                        self.calibration,
                    );
                    debug!("Duration ratio {:.3}, next global scale {:.3}", ratio, next);
                    state.set_global_length_scale(next);
                }
                let boost = next_boost(state.dynamic_boost_db(), metrics.mean_volume_db, self.calibration);
                if boost != state.dynamic_boost_db() {
                    info!(
                        "Track mean volume {:.1} dB, boost {:.1} -> {:.1} dB",
                        metrics.mean_volume_db,
                        state.dynamic_boost_db(),
                        boost
                    );
                }
                state.set_dynamic_boost_db(boost);
            }

            let candidate = Candidate {
                iteration,
                track: assembly.track.clone(),
                metrics,
                precision,
                quality,
                voice_ratio,
                segments,
                assembly,
            };
            if best.as_ref().map_or(true, |current| candidate.beats(current)) {
                if let Some(previous) = best.replace(candidate) {
                    self.artifacts.discard_iteration(previous.iteration);
                }
            } else {
                self.artifacts.discard_iteration(iteration);
            }

            if accepted {
                info!("Iteration {} accepted", iteration);
                converged = true;
                break;
            }
        }

        let best = best.ok_or(DubSyncError::AssemblyEmpty)?;
        if !converged {
            warn!(
                "No iteration reached the thresholds, using iteration {} (quality {:.1}, precision {:.1}%)",
                best.iteration, best.quality, best.precision
            );
        }

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&best.track.path, output).await?;
        let track = probe_wav(output)?;

        if let Some(cache) = self.cache {
            match cache.save(&state) {
                Ok(()) => info!("Calibration saved to {}", cache.path().display()),
                Err(e) => warn!("Failed to save calibration cache: {}", e),
            }
        }

        send_progress(
            &self.progress,
            ProgressUpdate::Finished { precision: best.precision, quality: best.quality },
        )
        .await;

        Ok(RunOutcome {
            track,
            metrics: best.metrics,
            precision: best.precision,
            quality: best.quality,
            voice_ratio: best.voice_ratio,
            best_iteration: best.iteration,
            iterations_run,
            converged,
            segments: best.segments,
            assembly: best.assembly,
            state,
        })
    }
}
