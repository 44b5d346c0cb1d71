//! Сборщик дорожки
//!
//! Идёт по сегментам в порядке реплик и выкладывает фрагменты: ведущую
//! тишину, клип (или тишину вместо него), паузы между репликами и хвост до
//! целевой длительности. Позиция считается в фреймах, поэтому итоговая
//! длина совпадает с целевой до семпла. Пауза считается от фактического
//! конца предыдущего фрагмента: расхождение клипа со слотом гасится
//! следующей паузой, и реплики остаются на своих местах.

use std::path::PathBuf;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::calibration::segment::precision;
use crate::config::AssemblyConfig;
use crate::error::{DubSyncError, Result};
use crate::media::{AudioFormat, Transcoder};
use crate::segment::{AudioClip, TimedSegment};
use crate::utils::ArtifactStore;

/// Вид фрагмента сборки
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceKind {
    Leading,
    Gap,
    Speech { index: usize, stretched: bool },
    Fallback { index: usize },
    Trailing,
}

/// Фрагмент с фактической длиной
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssembledPiece {
    pub kind: PieceKind,
    pub frames: u64,
    pub duration: f64,
}

/// Результат сборки
#[derive(Debug, Clone)]
pub struct AssemblyOutcome {
    /// Итоговая дорожка после финальной обработки
    pub track: AudioClip,
    pub pieces: Vec<AssembledPiece>,
    pub target_duration: f64,
    /// Фреймов обрезано в конце из-за перелёта
    pub trimmed_frames: u64,
    /// Суммарное расхождение пауз с таймлайном реплик, в фреймах
    pub drift_frames: u64,
    pub overlaps: usize,
    /// Реплики, чей клип не удалось преобразовать; вместо них тишина
    pub failed_segments: Vec<usize>,
}

impl AssemblyOutcome {
    /// Доля таймлайна, которую пришлось компенсировать паузами и обрезкой
    pub fn silence_compensation(&self) -> f64 {
        let target = self.pieces.iter().map(|p| p.frames).sum::<u64>().max(1);
        (self.drift_frames + self.trimmed_frames) as f64 / target as f64
    }

    pub fn stretched_segments(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| matches!(p.kind, PieceKind::Speech { stretched: true, .. }))
            .count()
    }
}

/// Сколько фреймов тишины вставить, если позиция отстаёт от начала реплики.
/// Паузы короче `gap_epsilon` и отрицательные не вставляются.
pub fn silence_frames(cursor: u64, start_frames: u64, format: AudioFormat, gap_epsilon: f64) -> Option<u64> {
    if start_frames <= cursor {
        return None;
    }
    let gap = start_frames - cursor;
    (format.seconds_for(gap) > gap_epsilon).then_some(gap)
}

/// Целевая длина клипа в фреймах, если его нужно растягивать.
///
/// Клип с точностью не ниже `exact_fit_precision` не трогается, иначе
/// коэффициент растяжения ограничивается [min_stretch, max_stretch].
pub fn stretch_target(clip_duration: f64, slot_duration: f64, format: AudioFormat, config: &AssemblyConfig) -> Option<u64> {
    if clip_duration <= 0.0 || precision(clip_duration, slot_duration) >= config.exact_fit_precision {
        return None;
    }
    let factor = (slot_duration / clip_duration).clamp(config.min_stretch, config.max_stretch);
    let frames = format.frames_for(clip_duration * factor);
    (frames > 0).then_some(frames)
}

/// Целевая длительность по умолчанию: конец последней реплики плюс запас
pub fn default_target_duration(segments: &[TimedSegment], trailing_pad_secs: f64) -> f64 {
    segments
        .iter()
        .map(|s| s.end_time)
        .fold(0.0, f64::max)
        + trailing_pad_secs
}

pub struct Assembler<'a> {
    transcoder: &'a dyn Transcoder,
    config: &'a AssemblyConfig,
    artifacts: &'a ArtifactStore,
}

impl<'a> Assembler<'a> {
    pub fn new(transcoder: &'a dyn Transcoder, config: &'a AssemblyConfig, artifacts: &'a ArtifactStore) -> Self {
        Self { transcoder, config, artifacts }
    }

    fn piece_path(&self, iteration: u32, n: usize, label: &str) -> Result<PathBuf> {
        self.artifacts.piece_path(iteration, &format!("piece{:04}_{}.wav", n, label))
    }

    async fn emit_silence(
        &self,
        iteration: u32,
        kind: PieceKind,
        frames: u64,
        paths: &mut Vec<PathBuf>,
        pieces: &mut Vec<AssembledPiece>,
    ) -> Result<u64> {
        let label = match kind {
            PieceKind::Leading => "lead".to_string(),
            PieceKind::Gap => "gap".to_string(),
            PieceKind::Trailing => "tail".to_string(),
            PieceKind::Fallback { index } => format!("fallback{:04}", index),
            PieceKind::Speech { index, .. } => format!("seg{:04}", index),
        };
        let path = self.piece_path(iteration, paths.len(), &label)?;
        let clip = self.transcoder.silence(frames, &path).await?;
        let actual = clip.frames();
        paths.push(clip.path);
        pieces.push(AssembledPiece {
            kind,
            frames: actual,
            duration: clip.duration,
        });
        Ok(actual)
    }

    /// Привести клип к формату дорожки и при необходимости растянуть.
    /// Растягивается уже приведённый WAV.
    async fn place_clip(
        &self,
        iteration: u32,
        n: usize,
        segment: &TimedSegment,
        clip: &AudioClip,
    ) -> Result<(AudioClip, bool)> {
        let format = self.transcoder.format();
        let conformed_path = self.piece_path(iteration, n, &format!("seg{:04}", segment.index))?;
        let conformed = self.transcoder.conform(&clip.path, &conformed_path).await?;
        let Some(frames) = stretch_target(conformed.duration, segment.duration, format, self.config) else {
            return Ok((conformed, false));
        };
        debug!(
            "Stretching segment {} from {:.3}s to {:.3}s",
            segment.index,
            conformed.duration,
            format.seconds_for(frames)
        );
        let stretched_path = self.piece_path(iteration, n, &format!("seg{:04}_stretched", segment.index))?;
        let stretched = self.transcoder.time_stretch(&conformed.path, frames, &stretched_path).await?;
        Ok((stretched, true))
    }

    /// Собрать дорожку длиной `target_duration` и записать её в `output`
    pub async fn assemble(
        &self,
        segments: &[TimedSegment],
        target_duration: f64,
        boost_db: f64,
        iteration: u32,
        output: &std::path::Path,
    ) -> Result<AssemblyOutcome> {
        if segments.is_empty() {
            return Err(DubSyncError::AssemblyEmpty);
        }

        let format = self.transcoder.format();
        let eps = self.config.gap_epsilon;
        let mut paths: Vec<PathBuf> = Vec::with_capacity(segments.len() * 2 + 2);
        let mut pieces: Vec<AssembledPiece> = Vec::with_capacity(segments.len() * 2 + 2);
        let mut cursor: u64 = 0;
        let mut drift: u64 = 0;
        let mut overlaps = 0usize;
        let mut prev_end: Option<f64> = None;
        let mut failed: Vec<usize> = Vec::new();

        for segment in segments {
            let start_frames = format.frames_for(segment.start_time);
            let timeline_gap = segment.start_time - prev_end.unwrap_or(0.0);
            if prev_end.is_some() && timeline_gap < -eps {
                overlaps += 1;
                warn!(
                    "Segment {} overlaps the previous cue by {:.3}s, no gap emitted",
                    segment.index, -timeline_gap
                );
            }

            let emitted = match silence_frames(cursor, start_frames, format, eps) {
                Some(frames) => {
                    let kind = if prev_end.is_none() { PieceKind::Leading } else { PieceKind::Gap };
                    self.emit_silence(iteration, kind, frames, &mut paths, &mut pieces).await?
                }
                None => 0,
            };
            cursor += emitted;
            if prev_end.is_some() {
                let expected = format.frames_for(timeline_gap.max(0.0));
                drift += expected.abs_diff(emitted);
            }

            let slot_frames = format.frames_for(segment.duration);
            let placed = match (&segment.rendered_clip, segment.is_fallback()) {
                (Some(clip), false) => match self.place_clip(iteration, paths.len(), segment, clip).await {
                    Ok(placed) => Some(placed),
                    Err(e) => {
                        warn!(
                            "Segment {} clip could not be converted, substituting silence: {}",
                            segment.index, e
                        );
                        failed.push(segment.index);
                        None
                    }
                },
                _ => None,
            };
            match placed {
                Some((produced, stretched)) => {
                    cursor += produced.frames();
                    pieces.push(AssembledPiece {
                        kind: PieceKind::Speech { index: segment.index, stretched },
                        frames: produced.frames(),
                        duration: produced.duration,
                    });
                    paths.push(produced.path);
                }
                None => {
                    // тишина ровно на длительность реплики
                    let kind = PieceKind::Fallback { index: segment.index };
                    cursor += self.emit_silence(iteration, kind, slot_frames, &mut paths, &mut pieces).await?;
                }
            }
            prev_end = Some(segment.end_time);
        }

        let target_frames = format.frames_for(target_duration);
        if let Some(frames) = silence_frames(cursor, target_frames, format, eps) {
            cursor += self.emit_silence(iteration, PieceKind::Trailing, frames, &mut paths, &mut pieces).await?;
        }
        let last_end = prev_end.unwrap_or(0.0);
        let expected_tail = format.frames_for((target_duration - last_end).max(0.0));
        let emitted_tail = pieces
            .last()
            .filter(|p| p.kind == PieceKind::Trailing)
            .map(|p| p.frames)
            .unwrap_or(0);
        drift += expected_tail.abs_diff(emitted_tail);

        if paths.is_empty() {
            return Err(DubSyncError::AssemblyEmpty);
        }

        let joined_path = self.artifacts.piece_path(iteration, "joined.wav")?;
        let mut joined = self.transcoder.concat(&paths, &joined_path).await?;

        let mut trimmed = 0;
        if cursor > target_frames {
            trimmed = cursor - target_frames;
            warn!(
                "Assembled track overshoots target by {:.3}s, trimming",
                format.seconds_for(trimmed)
            );
            let fitted_path = self.artifacts.piece_path(iteration, "fitted.wav")?;
            joined = self.transcoder.fit(&joined.path, target_frames, &fitted_path).await?;
        }

        let track = if self.config.polish {
            self.transcoder.polish(&joined.path, boost_db, output).await?
        } else {
            tokio::fs::copy(&joined.path, output).await?;
            crate::media::probe_wav(output)?
        };

        let outcome = AssemblyOutcome {
            track,
            pieces,
            target_duration,
            trimmed_frames: trimmed,
            drift_frames: drift,
            overlaps,
            failed_segments: failed,
        };
        info!(
            "Assembled {} pieces ({} stretched, {} failed): {:.3}s for target {:.3}s (boost {:.1} dB)",
            outcome.pieces.len(),
            outcome.stretched_segments(),
            outcome.failed_segments.len(),
            outcome.track.duration,
            target_duration,
            boost_db
        );
        Ok(outcome)
    }
}
