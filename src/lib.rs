//! Основной файл библиотеки dubsync
//!
//! Озвучка по субтитрам с подгонкой длительности: каждая реплика
//! синтезируется с подбором масштаба длительности, клипы и паузы
//! собираются в дорожку ровно нужной длины, а сошедшиеся параметры
//! сохраняются для следующего прогона.

pub mod analysis;
pub mod assembly;
pub mod calibration;
pub mod config;
pub mod error;
pub mod media;
pub mod progress;
pub mod report;
pub mod segment;
pub mod subtitle;
pub mod tts;
pub mod utils;

use std::path::Path;
use std::sync::Arc;
use log::{info, warn};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::analysis::QualityAssessor;
use crate::assembly::default_target_duration;
use crate::calibration::{pipeline_key, CalibrationCache, CalibrationState, GlobalCalibrator};
use crate::media::Transcoder;
use crate::progress::{send_progress, ProgressUpdate};
use crate::tts::{SpeechEngine, SynthesisAdapter};
use crate::utils::ArtifactStore;

pub use crate::config::DubSyncConfig;
pub use crate::error::{DubSyncError, Result};
pub use crate::report::RunReport;
pub use crate::segment::TimedSegment;

/// Основная структура для работы с библиотекой
pub struct DubSync {
    config: DubSyncConfig,
    engine: Arc<dyn SpeechEngine>,
    assessor: Arc<dyn QualityAssessor>,
    transcoder: Arc<dyn Transcoder>,
    progress: Option<Sender<ProgressUpdate>>,
    cancel: CancellationToken,
}

impl DubSync {
    /// Создать экземпляр с движком, анализатором и транскодером из конфигурации
    pub fn new(config: DubSyncConfig) -> Result<Self> {
        config.validate()?;
        let engine = tts::create_engine(&config.synthesis)?;
        let assessor = analysis::create_assessor(&config.assembly)?;
        let transcoder = media::create_transcoder(&config.assembly)?;
        Ok(Self::assemble_parts(config, engine, assessor, transcoder))
    }

    /// Создать экземпляр с готовыми компонентами
    pub fn with_components(
        config: DubSyncConfig,
        engine: Arc<dyn SpeechEngine>,
        assessor: Arc<dyn QualityAssessor>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble_parts(config, engine, assessor, transcoder))
    }

    fn assemble_parts(
        config: DubSyncConfig,
        engine: Arc<dyn SpeechEngine>,
        assessor: Arc<dyn QualityAssessor>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            config,
            engine,
            assessor,
            transcoder,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Установить канал прогресса
    pub fn with_progress(mut self, sender: Sender<ProgressUpdate>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Токен для кооперативной отмены прогона
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &DubSyncConfig {
        &self.config
    }

    /// Озвучить файл субтитров и записать дорожку в `output`.
    ///
    /// Если `target_duration` не задана, берётся конец последней реплики
    /// плюс `trailing_pad_secs`.
    pub async fn process(&self, cue_path: &Path, output: &Path, target_duration: Option<f64>) -> Result<RunReport> {
        info!("Starting dubbing of {}", cue_path.display());
        send_progress(&self.progress, ProgressUpdate::Started).await;

        let segments = subtitle::parse_cue_file(cue_path)?;
        send_progress(&self.progress, ProgressUpdate::Parsed { segments: segments.len() }).await;

        self.process_segments(&segments, output, target_duration).await
    }

    /// Озвучить уже разобранные сегменты
    pub async fn process_segments(
        &self,
        segments: &[TimedSegment],
        output: &Path,
        target_duration: Option<f64>,
    ) -> Result<RunReport> {
        if segments.is_empty() {
            return Err(DubSyncError::AssemblyEmpty);
        }
        let last_end = default_target_duration(segments, 0.0);
        let target = match target_duration {
            Some(t) if t.is_finite() && t > 0.0 => t,
            Some(t) => {
                return Err(DubSyncError::Configuration(format!("Invalid target duration: {}", t)));
            }
            None => last_end + self.config.assembly.trailing_pad_secs,
        };
        if target < last_end {
            warn!(
                "Target duration {:.3}s ends before the last cue ({:.3}s), the tail will be trimmed",
                target, last_end
            );
        }

        let artifacts = ArtifactStore::new(self.config.work_dir.as_deref(), self.config.keep_artifacts)?;
        let adapter = SynthesisAdapter::new(self.engine.clone(), &self.config.synthesis);
        let format = self.transcoder.format();

        let cache = self.config.cache_path.as_ref().map(|path| {
            CalibrationCache::new(
                path,
                pipeline_key(&self.engine.name(), &self.config.synthesis.voice, format.sample_rate, format.channels),
            )
        });
        let state = match &cache {
            Some(cache) => cache.load(&self.config.calibration),
            None => CalibrationState::new(&self.config.calibration),
        };

        info!(
            "Run {}: {} segments, target {:.3}s, engine {}",
            artifacts.run_id(),
            segments.len(),
            target,
            adapter.engine_name()
        );

        let mut calibrator = GlobalCalibrator::new(
            &adapter,
            self.assessor.as_ref(),
            self.transcoder.as_ref(),
            &artifacts,
            &self.config.calibration,
            &self.config.assembly,
            &self.config.synthesis.voice,
        )
        .with_progress(self.progress.clone())
        .with_cancellation(self.cancel.clone());
        if let Some(cache) = &cache {
            calibrator = calibrator.with_cache(cache);
        }

        let outcome = calibrator.run(segments, target, state, output).await?;
        let report = RunReport::from_outcome(artifacts.run_id(), &outcome);

        if report.fallback_segments.is_empty() {
            info!(
                "Done: precision {:.1}%, quality {:.1}",
                report.precision, report.quality
            );
        } else {
            warn!(
                "Done with {} silent segments {:?}: precision {:.1}%, quality {:.1}",
                report.fallback_segments.len(),
                report.fallback_segments,
                report.precision,
                report.quality
            );
        }
        Ok(report)
    }
}
