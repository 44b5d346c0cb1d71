//! Отчёт о прогоне
//!
//! Итоговая точность и качество, история итераций и счётчики попыток по
//! сегментам. Сегменты, замененные тишиной, перечисляются отдельно для
//! ручной проверки.

use std::fmt;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assembly::AssembledPiece;
use crate::calibration::segment::precision;
use crate::calibration::{IterationRecord, RunOutcome};
use crate::error::Result;

/// Строка отчёта по одному сегменту
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentReport {
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub attempts: u32,
    pub accepted: bool,
    pub final_scale: f64,
    pub measured_duration: Option<f64>,
    pub precision: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub output: PathBuf,
    pub target_duration: f64,
    pub final_duration: f64,
    pub precision: f64,
    pub quality: f64,
    pub voice_ratio: f64,
    pub converged: bool,
    pub best_iteration: u32,
    pub global_length_scale: f64,
    pub dynamic_boost_db: f64,
    pub iterations: Vec<IterationRecord>,
    pub segments: Vec<SegmentReport>,
    /// Раскладка итоговой дорожки
    pub pieces: Vec<AssembledPiece>,
    /// Индексы сегментов, замененных тишиной
    pub fallback_segments: Vec<usize>,
}

impl RunReport {
    pub fn from_outcome(run_id: &str, outcome: &RunOutcome) -> Self {
        let segments: Vec<SegmentReport> = outcome
            .segments
            .iter()
            .map(|s| SegmentReport {
                index: s.index,
                start_time: s.start_time,
                end_time: s.end_time,
                text: s.normalized_text.clone(),
                attempts: s.attempt_count,
                accepted: s.accepted,
                final_scale: s.length_scale,
                measured_duration: s.measured_duration.filter(|_| s.accepted),
                precision: s
                    .measured_duration
                    .filter(|_| s.accepted)
                    .map(|m| precision(m, s.duration)),
            })
            .collect();
        let fallback_segments = outcome
            .segments
            .iter()
            .filter(|s| s.is_fallback())
            .map(|s| s.index)
            .collect();

        Self {
            run_id: run_id.to_string(),
            created_at: Utc::now(),
            output: outcome.track.path.clone(),
            target_duration: outcome.assembly.target_duration,
            final_duration: outcome.track.duration,
            precision: outcome.precision,
            quality: outcome.quality,
            voice_ratio: outcome.voice_ratio,
            converged: outcome.converged,
            best_iteration: outcome.best_iteration,
            global_length_scale: outcome.state.global_length_scale(),
            dynamic_boost_db: outcome.state.dynamic_boost_db(),
            iterations: outcome.state.iteration_history.clone(),
            segments,
            pieces: outcome.assembly.pieces.clone(),
            fallback_segments,
        }
    }

    /// Сохранить отчёт: JSON для `.json`, иначе текст
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = if path.extension().map_or(false, |e| e.eq_ignore_ascii_case("json")) {
            serde_json::to_string_pretty(self)?
        } else {
            self.to_string()
        };
        std::fs::write(path, body)?;
        Ok(())
    }

    pub fn total_attempts(&self) -> u32 {
        self.segments.iter().map(|s| s.attempts).sum()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} at {}", self.run_id, self.created_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "Output: {}", self.output.display())?;
        writeln!(
            f,
            "Duration: {:.3}s (target {:.3}s)",
            self.final_duration, self.target_duration
        )?;
        writeln!(
            f,
            "Precision: {:.1}%  Quality: {:.1}  Voiced segments: {:.0}%",
            self.precision,
            self.quality,
            self.voice_ratio * 100.0
        )?;
        writeln!(
            f,
            "Iteration {} of {} selected{}",
            self.best_iteration,
            self.iterations.len(),
            if self.converged { "" } else { " (thresholds not reached)" }
        )?;
        writeln!(
            f,
            "Calibration: scale {:.3}, boost {:.1} dB",
            self.global_length_scale, self.dynamic_boost_db
        )?;

        writeln!(f, "\nIterations:")?;
        for r in &self.iterations {
            writeln!(
                f,
                "  #{}: scale {:.3}, boost {:.1} dB, {:.3}s, precision {:.1}%, quality {:.1}, {} fallback",
                r.iteration, r.scale, r.boost_db, r.final_duration, r.precision, r.quality_score, r.fallback_segments
            )?;
        }

        writeln!(f, "\nSegments ({} attempts total):", self.total_attempts())?;
        for s in &self.segments {
            let status = match s.precision {
                Some(p) if s.accepted => format!("ok {:.1}%", p),
                _ => "SILENCE".to_string(),
            };
            writeln!(
                f,
                "  {:>4} [{:>8.3} - {:>8.3}] tries {} scale {:.3} {}",
                s.index, s.start_time, s.end_time, s.attempts, s.final_scale, status
            )?;
        }

        if self.fallback_segments.is_empty() {
            writeln!(f, "\nNo fallback segments")?;
        } else {
            writeln!(f, "\nFallback segments (review manually):")?;
            for s in self.segments.iter().filter(|s| self.fallback_segments.contains(&s.index)) {
                writeln!(f, "  {}: {}", s.index, s.text)?;
            }
        }
        Ok(())
    }
}
