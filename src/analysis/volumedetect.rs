//! Анализатор громкости через ffmpeg volumedetect
//!
//! Средняя и пиковая громкость берутся из вывода фильтра `volumedetect`,
//! остальные метрики считает встроенный анализатор.

use std::path::Path;
use std::time::Duration;
use async_trait::async_trait;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::analysis::{AudioQualityMetrics, PcmAnalyzer, QualityAssessor};
use crate::error::{DubSyncError, Result};
use crate::segment::AudioClip;
use crate::utils::process::{ensure_program, run_with_timeout};

static MEAN_VOLUME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"mean_volume:\s*(-?[\d.]+|-inf) dB").expect("valid mean_volume regex"));
static MAX_VOLUME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"max_volume:\s*(-?[\d.]+|-inf) dB").expect("valid max_volume regex"));

pub struct VolumeDetectAnalyzer {
    inner: PcmAnalyzer,
    program: String,
    timeout: Duration,
}

/// Разобрать вывод volumedetect, вернуть (mean, max) в dB
pub fn parse_volumedetect(stderr: &str) -> Option<(f64, f64)> {
    let parse = |re: &Regex| -> Option<f64> {
        let value = re.captures(stderr)?.get(1)?.as_str();
        if value == "-inf" {
            return Some(-90.0);
        }
        value.parse::<f64>().ok().map(|v| v.max(-90.0))
    };
    Some((parse(&MEAN_VOLUME)?, parse(&MAX_VOLUME)?))
}

impl VolumeDetectAnalyzer {
    pub fn new(inner: PcmAnalyzer, timeout: Duration) -> Result<Self> {
        let program = ensure_program("ffmpeg")?;
        Ok(Self {
            inner,
            program: program.to_string_lossy().into_owned(),
            timeout,
        })
    }

    async fn measure(&self, path: &Path) -> Result<(f64, f64)> {
        let args = vec![
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-i".to_string(),
            path.to_string_lossy().into_owned(),
            "-af".to_string(),
            "volumedetect".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let output = run_with_timeout(&self.program, &args, None, self.timeout)
            .await
            .map_err(|e| DubSyncError::AnalysisFailure(e.to_string()))?;

        parse_volumedetect(&output.stderr).ok_or_else(|| {
            DubSyncError::AnalysisFailure(format!("No volumedetect output for {}", path.display()))
        })
    }
}

#[async_trait]
impl QualityAssessor for VolumeDetectAnalyzer {
    async fn assess(&self, clip: &AudioClip) -> AudioQualityMetrics {
        let (mean, max) = match self.measure(&clip.path).await {
            Ok(levels) => levels,
            Err(e) => {
                warn!("Falling back to worst-case metrics: {}", e);
                return AudioQualityMetrics::worst_case();
            }
        };
        let mut metrics = match self.inner.analyze(&clip.path).await {
            Ok(analysis) => analysis.metrics,
            Err(e) => {
                warn!("Falling back to worst-case metrics: {}", e);
                return AudioQualityMetrics::worst_case();
            }
        };
        metrics.mean_volume_db = mean;
        metrics.peak_volume_db = max;
        metrics
    }
}
