//! Адаптер синтеза речи
//!
//! Каждый вызов движка проходит через семафор (по умолчанию одно
//! разрешение), жёсткий таймаут и проверку результата. Разрешение
//! освобождается при любом исходе, включая таймаут и панику в движке.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, warn};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::config::SynthesisConfig;
use crate::error::{DubSyncError, Result};
use crate::media::pcm;
use crate::media::probe_wav;
use crate::segment::AudioClip;
use crate::tts::{SpeechEngine, SynthesisRequest};

pub struct SynthesisAdapter {
    engine: Arc<dyn SpeechEngine>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    min_output_bytes: u64,
    max_concurrent: usize,
}

impl SynthesisAdapter {
    pub fn new(engine: Arc<dyn SpeechEngine>, config: &SynthesisConfig) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            engine,
            semaphore: Arc::new(Semaphore::new(permits)),
            timeout: Duration::from_secs(config.timeout_secs),
            min_output_bytes: config.min_output_bytes,
            max_concurrent: permits,
        }
    }

    /// Переопределить таймаут (для тестов и коротких реплик)
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = limit;
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn engine_name(&self) -> String {
        self.engine.name()
    }

    /// Синтезировать реплику в `output`; в клипе - измеренная длительность
    pub async fn synthesize(&self, request: &SynthesisRequest, output: &Path) -> Result<AudioClip> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| DubSyncError::SynthesisFailed(format!("Synthesis pool closed: {}", e)))?;

        let started = Instant::now();
        let produced = match timeout(self.timeout, self.engine.render(request, output)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Synthesis of {:?} timed out after {:?}, engine call dropped",
                    request.text, self.timeout
                );
                return Err(DubSyncError::SynthesisTimeout { timeout: self.timeout });
            }
        };
        debug!("Engine finished in {:.2}s", started.elapsed().as_secs_f64());

        self.validate(&produced)
    }

    /// Проверить, что клип не пустой, и измерить его
    fn validate(&self, path: &Path) -> Result<AudioClip> {
        let size = std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| DubSyncError::SynthesisEmptyOutput(format!("{}: {}", path.display(), e)))?;
        if size < self.min_output_bytes {
            return Err(DubSyncError::SynthesisEmptyOutput(format!(
                "{} is only {} bytes",
                path.display(),
                size
            )));
        }

        let clip = measure_clip(path)
            .map_err(|e| DubSyncError::SynthesisEmptyOutput(format!("{}: {}", path.display(), e)))?;
        if clip.duration <= 0.0 {
            return Err(DubSyncError::SynthesisEmptyOutput(format!(
                "{} has zero duration",
                path.display()
            )));
        }
        Ok(clip)
    }
}

/// Измерить клип: WAV по заголовку, остальное через декодер
pub fn measure_clip(path: &Path) -> Result<AudioClip> {
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    if is_wav {
        return probe_wav(path);
    }
    let buffer = pcm::decode_audio_file(path)?;
    Ok(AudioClip {
        path: path.to_path_buf(),
        duration: buffer.duration(),
        sample_rate: buffer.sample_rate,
        channels: buffer.channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use crate::media::pcm::{encode_wav, PcmBuffer};

    struct SlowEngine {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SpeechEngine for SlowEngine {
        async fn render(&self, request: &SynthesisRequest, output: &Path) -> Result<PathBuf> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            let frames = (request.length_scale * 24_000.0) as u64;
            encode_wav(&PcmBuffer::new(vec![0.1; frames as usize], 24_000, 1), output)?;
            Ok(output.to_path_buf())
        }

        fn name(&self) -> String {
            "slow".to_string()
        }
    }

    struct EmptyEngine;

    #[async_trait]
    impl SpeechEngine for EmptyEngine {
        async fn render(&self, _request: &SynthesisRequest, output: &Path) -> Result<PathBuf> {
            encode_wav(&PcmBuffer::new(Vec::new(), 24_000, 1), output)?;
            Ok(output.to_path_buf())
        }

        fn name(&self) -> String {
            "empty".to_string()
        }
    }

    fn request(scale: f64) -> SynthesisRequest {
        SynthesisRequest { text: "Hello.".into(), length_scale: scale, voice: "v".into() }
    }

    fn slow(delay: Duration) -> Arc<SlowEngine> {
        Arc::new(SlowEngine { delay, active: AtomicUsize::new(0), peak: AtomicUsize::new(0) })
    }

    #[tokio::test]
    async fn test_measures_duration() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SynthesisAdapter::new(slow(Duration::from_millis(1)), &SynthesisConfig::default());
        let clip = adapter.synthesize(&request(1.5), &dir.path().join("a.wav")).await.unwrap();
        assert!((clip.duration - 1.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_timeout_releases_permit() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SynthesisAdapter::new(slow(Duration::from_secs(30)), &SynthesisConfig::default())
            .with_timeout(Duration::from_millis(50));

        let err = adapter.synthesize(&request(1.0), &dir.path().join("a.wav")).await.unwrap_err();
        assert!(matches!(err, DubSyncError::SynthesisTimeout { .. }));
        assert_eq!(adapter.semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_empty_output_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SynthesisAdapter::new(Arc::new(EmptyEngine), &SynthesisConfig::default());
        let err = adapter.synthesize(&request(1.0), &dir.path().join("a.wav")).await.unwrap_err();
        assert!(matches!(err, DubSyncError::SynthesisEmptyOutput(_)));
    }

    #[tokio::test]
    async fn test_single_permit_serializes_calls() {
        let dir = tempfile::tempdir().unwrap();
        let engine = slow(Duration::from_millis(20));
        let adapter = Arc::new(SynthesisAdapter::new(engine.clone(), &SynthesisConfig::default()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let adapter = adapter.clone();
            let path = dir.path().join(format!("{}.wav", i));
            handles.push(tokio::spawn(async move { adapter.synthesize(&request(0.5), &path).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(engine.peak.load(Ordering::SeqCst), 1);
    }
}
