use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tempfile::TempDir;

use dubsync::analysis::{AudioQualityMetrics, QualityAssessor};
use dubsync::assembly::PieceKind;
use dubsync::media::pcm::{encode_wav, PcmBuffer};
use dubsync::media::{AudioFormat, NativeTranscoder, Transcoder};
use dubsync::progress::ProgressUpdate;
use dubsync::segment::AudioClip;
use dubsync::tts::{SpeechEngine, SynthesisRequest};
use dubsync::{DubSync, DubSyncConfig, DubSyncError, RunReport};

const ENGINE_RATE: u32 = 16_000;
const SECONDS_PER_WORD: f64 = 0.5;

/// Движок с длительностью `слова * 0.5 с * stretch * масштаб`
struct ToneEngine {
    stretch: f64,
    fail_marker: Option<&'static str>,
    calls: AtomicU32,
}

impl ToneEngine {
    fn new(stretch: f64) -> Arc<Self> {
        Arc::new(Self { stretch, fail_marker: None, calls: AtomicU32::new(0) })
    }

    fn failing_on(marker: &'static str) -> Arc<Self> {
        Arc::new(Self { stretch: 1.0, fail_marker: Some(marker), calls: AtomicU32::new(0) })
    }
}

fn render_tone(request: &SynthesisRequest, stretch: f64, output: &Path) -> dubsync::Result<PathBuf> {
    let words = request.text.split_whitespace().count() as f64;
    let seconds = words * SECONDS_PER_WORD * stretch * request.length_scale;
    let frames = (seconds * ENGINE_RATE as f64).round() as usize;
    let samples = (0..frames)
        .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / ENGINE_RATE as f32).sin())
        .collect();
    encode_wav(&PcmBuffer::new(samples, ENGINE_RATE, 1), output)?;
    Ok(output.to_path_buf())
}

#[async_trait]
impl SpeechEngine for ToneEngine {
    async fn render(&self, request: &SynthesisRequest, output: &Path) -> dubsync::Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = self.fail_marker {
            if request.text.contains(marker) {
                return Err(DubSyncError::SynthesisFailed("engine exited with status 1".into()));
            }
        }
        render_tone(request, self.stretch, output)
    }

    fn name(&self) -> String {
        "tone".into()
    }
}

/// Медленный движок, считающий одновременные вызовы
#[derive(Default)]
struct SlowEngine {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl SpeechEngine for SlowEngine {
    async fn render(&self, request: &SynthesisRequest, output: &Path) -> dubsync::Result<PathBuf> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = render_tone(request, 1.0, output);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> String {
        "slow".into()
    }
}

/// Встроенный транскодер, который не может привести клип реплики `marker`
struct BrokenConform {
    inner: NativeTranscoder,
    marker: &'static str,
}

#[async_trait]
impl Transcoder for BrokenConform {
    fn format(&self) -> AudioFormat {
        self.inner.format()
    }

    async fn silence(&self, frames: u64, output: &Path) -> dubsync::Result<AudioClip> {
        self.inner.silence(frames, output).await
    }

    async fn conform(&self, input: &Path, output: &Path) -> dubsync::Result<AudioClip> {
        if output.to_string_lossy().contains(self.marker) {
            return Err(DubSyncError::Transcoder("conform crashed".into()));
        }
        self.inner.conform(input, output).await
    }

    async fn time_stretch(&self, input: &Path, frames: u64, output: &Path) -> dubsync::Result<AudioClip> {
        self.inner.time_stretch(input, frames, output).await
    }

    async fn fit(&self, input: &Path, frames: u64, output: &Path) -> dubsync::Result<AudioClip> {
        self.inner.fit(input, frames, output).await
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> dubsync::Result<AudioClip> {
        self.inner.concat(inputs, output).await
    }

    async fn polish(&self, input: &Path, boost_db: f64, output: &Path) -> dubsync::Result<AudioClip> {
        self.inner.polish(input, boost_db, output).await
    }
}

/// Оценщик: клипы реплик всегда хорошие, для дорожки - заданные метрики
struct TrackAssessor {
    track: AudioQualityMetrics,
}

#[async_trait]
impl QualityAssessor for TrackAssessor {
    async fn assess(&self, clip: &AudioClip) -> AudioQualityMetrics {
        if clip.path.file_name().map_or(false, |n| n == "track.wav") {
            self.track
        } else {
            good()
        }
    }
}

fn good() -> AudioQualityMetrics {
    AudioQualityMetrics {
        has_voice: true,
        mean_volume_db: -20.0,
        peak_volume_db: -4.0,
        spectral_quality_score: 80.0,
        is_clipped: false,
        dynamic_range_db: 15.0,
    }
}

fn quiet() -> AudioQualityMetrics {
    AudioQualityMetrics { mean_volume_db: -60.0, ..good() }
}

struct Fixture {
    dir: TempDir,
    config: DubSyncConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DubSyncConfig::default();
        config.synthesis.min_output_bytes = 100;
        config.cache_path = Some(dir.path().join("calibration.json"));
        config.work_dir = Some(dir.path().join("work"));
        Self { dir, config }
    }

    fn write_cues(&self, content: &str) -> PathBuf {
        let path = self.dir.path().join("cues.vtt");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn output(&self) -> PathBuf {
        self.dir.path().join("out.wav")
    }

    fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.config.assembly.sample_rate,
            channels: self.config.assembly.channels,
        }
    }

    fn dubsync(&self, engine: Arc<dyn SpeechEngine>, track: AudioQualityMetrics) -> DubSync {
        self.dubsync_with(engine, track, Arc::new(NativeTranscoder::new(self.format())))
    }

    fn dubsync_with(
        &self,
        engine: Arc<dyn SpeechEngine>,
        track: AudioQualityMetrics,
        transcoder: Arc<dyn Transcoder>,
    ) -> DubSync {
        DubSync::with_components(self.config.clone(), engine, Arc::new(TrackAssessor { track }), transcoder).unwrap()
    }
}

const TWO_CUES: &str = "WEBVTT

00:00:01.000 --> 00:00:03.000
Hello there my friend

00:00:04.000 --> 00:00:06.000
World of many wonders
";

fn piece_seconds(report: &RunReport, kind: PieceKind) -> Vec<f64> {
    report
        .pieces
        .iter()
        .filter(|p| p.kind == kind)
        .map(|p| p.duration)
        .collect()
}

fn speech_order(report: &RunReport) -> Vec<usize> {
    report
        .pieces
        .iter()
        .filter_map(|p| match p.kind {
            PieceKind::Speech { index, .. } => Some(index),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_two_cues_fill_target_timeline() {
    let fx = Fixture::new();
    let cues = fx.write_cues(TWO_CUES);
    let dubsync = fx.dubsync(ToneEngine::new(1.0), good());

    let report = dubsync.process(&cues, &fx.output(), Some(7.0)).await.unwrap();

    assert!((report.final_duration - 7.0).abs() < 0.02, "{}", report.final_duration);
    assert!(report.converged);
    assert_eq!(report.best_iteration, 1);
    assert!(report.fallback_segments.is_empty());

    let leading = piece_seconds(&report, PieceKind::Leading);
    let gaps = piece_seconds(&report, PieceKind::Gap);
    let trailing = piece_seconds(&report, PieceKind::Trailing);
    assert_eq!(leading.len(), 1);
    assert_eq!(gaps.len(), 1);
    assert_eq!(trailing.len(), 1);
    assert!((leading[0] - 1.0).abs() < 0.02);
    assert!((gaps[0] - 1.0).abs() < 0.02);
    assert!((trailing[0] - 1.0).abs() < 0.02);

    // порядок фрагментов совпадает с порядком реплик
    assert_eq!(speech_order(&report), vec![1, 2]);

    let (duration, rate, channels) = dubsync::media::pcm::wav_duration(fx.output()).unwrap();
    assert_eq!(rate, 24_000);
    assert_eq!(channels, 1);
    assert!((duration - 7.0).abs() <= 1.0 / 24_000.0 + 1e-9);
}

#[tokio::test]
async fn test_long_engine_is_calibrated_per_cue() {
    let fx = Fixture::new();
    let cues = fx.write_cues(TWO_CUES);
    let dubsync = fx.dubsync(ToneEngine::new(1.5), good());

    let report = dubsync.process(&cues, &fx.output(), Some(7.0)).await.unwrap();

    assert!(report.converged);
    assert_eq!(report.best_iteration, 1);
    assert_eq!(report.iterations[0].fallback_segments, 0);
    assert!(report.fallback_segments.is_empty());
    assert_eq!(speech_order(&report), vec![1, 2]);
    assert!((report.final_duration - 7.0).abs() < 0.02);

    let config = &fx.config.calibration;
    for segment in &report.segments {
        assert!(segment.accepted);
        assert!(segment.attempts <= config.max_retries);
        assert!((segment.final_scale - 2.0 / 3.0).abs() < 1e-6, "{}", segment.final_scale);
        assert!(segment.precision.unwrap() >= config.precision_floor);
    }

    // сохраняются параметры принятой итерации
    let accepted = &report.iterations[0];
    assert_eq!(report.global_length_scale, accepted.scale);
    assert_eq!(report.dynamic_boost_db, accepted.boost_db);
}

#[tokio::test]
async fn test_long_engine_lowers_global_scale() {
    let mut fx = Fixture::new();
    // одна попытка на реплику: подстраивается только глобальный масштаб
    fx.config.calibration.max_retries = 1;
    let cues = fx.write_cues(TWO_CUES);
    let dubsync = fx.dubsync(ToneEngine::new(1.5), good());

    let report = dubsync.process(&cues, &fx.output(), Some(7.0)).await.unwrap();

    let scales: Vec<f64> = report.iterations.iter().map(|r| r.scale).collect();
    assert_eq!(scales.len(), 3);
    assert!(scales.windows(2).all(|w| w[1] < w[0]), "{:?}", scales);
    assert_eq!(report.iterations[0].fallback_segments, 2);

    assert!(report.converged);
    assert_eq!(report.best_iteration, 3);
    assert!((report.global_length_scale - 2.0 / 3.0).abs() < 1e-6);
    assert_eq!(report.global_length_scale, scales[2]);
    assert!(report.fallback_segments.is_empty());
    assert!((report.final_duration - 7.0).abs() < 0.02);

    let config = &fx.config.calibration;
    for scale in scales {
        assert!(scale >= config.min_scale && scale <= config.max_scale);
    }
}

#[tokio::test]
async fn test_calibration_is_reused_on_next_run() {
    let mut fx = Fixture::new();
    fx.config.calibration.max_retries = 1;
    let cues = fx.write_cues(TWO_CUES);

    let first = fx
        .dubsync(ToneEngine::new(1.5), good())
        .process(&cues, &fx.output(), Some(7.0))
        .await
        .unwrap();
    assert!(fx.dir.path().join("calibration.json").exists());
    assert!(first.global_length_scale < 1.0);

    let second = fx
        .dubsync(ToneEngine::new(1.5), good())
        .process(&cues, &fx.output(), Some(7.0))
        .await
        .unwrap();
    assert!((second.iterations[0].scale - first.global_length_scale).abs() < 1e-9);
    assert!(second.converged);
    assert_eq!(second.iterations.len(), 1);
}

#[tokio::test]
async fn test_failed_segment_becomes_silence() {
    let fx = Fixture::new();
    let cues = fx.write_cues(
        "WEBVTT

00:00:01.000 --> 00:00:03.000
Hello there my friend

00:00:04.000 --> 00:00:06.000
This broken line fails
",
    );
    let engine = ToneEngine::failing_on("broken");
    let dubsync = fx.dubsync(engine.clone(), good());

    let report = dubsync.process(&cues, &fx.output(), Some(7.0)).await.unwrap();

    assert_eq!(report.fallback_segments, vec![2]);
    let broken = &report.segments[1];
    assert!(!broken.accepted);
    assert_eq!(broken.attempts, fx.config.calibration.max_retries);

    let fallback = piece_seconds(&report, PieceKind::Fallback { index: 2 });
    assert_eq!(fallback.len(), 1);
    assert!((fallback[0] - 2.0).abs() <= 1.0 / 24_000.0 + 1e-9);
    assert!((report.final_duration - 7.0).abs() < 0.02);
    assert!(report.to_string().contains("Fallback segments"));
}

#[tokio::test]
async fn test_unconvertible_clip_becomes_silence() {
    let fx = Fixture::new();
    let cues = fx.write_cues(TWO_CUES);
    let transcoder = Arc::new(BrokenConform { inner: NativeTranscoder::new(fx.format()), marker: "seg0002" });
    let dubsync = fx.dubsync_with(ToneEngine::new(1.0), good(), transcoder);

    let report = dubsync.process(&cues, &fx.output(), Some(7.0)).await.unwrap();

    assert_eq!(report.fallback_segments, vec![2]);
    assert!(report.segments[0].accepted);
    assert!(!report.segments[1].accepted);
    assert_eq!(report.iterations[0].fallback_segments, 1);
    assert_eq!(speech_order(&report), vec![1]);

    let fallback = piece_seconds(&report, PieceKind::Fallback { index: 2 });
    assert_eq!(fallback.len(), 1);
    assert!((fallback[0] - 2.0).abs() <= 1.0 / 24_000.0 + 1e-9);
    assert!((report.final_duration - 7.0).abs() < 0.02);
    assert!(fx.output().exists());
}

async fn run_parallel(cooldown_every: usize) -> (RunReport, usize) {
    let mut fx = Fixture::new();
    fx.config.synthesis.max_concurrent = 2;
    fx.config.calibration.cooldown_every = cooldown_every;
    fx.config.calibration.cooldown_ms = 5;
    let cues = fx.write_cues(
        "WEBVTT

00:00:01.000 --> 00:00:03.000
Hello there my friend

00:00:04.000 --> 00:00:06.000
World of many wonders

00:00:07.000 --> 00:00:09.000
Another line right here

00:00:10.000 --> 00:00:12.000
Yet one more line

00:00:13.000 --> 00:00:15.000
And the final words
",
    );
    let engine = Arc::new(SlowEngine::default());
    let report = fx
        .dubsync(engine.clone(), good())
        .process(&cues, &fx.output(), Some(16.0))
        .await
        .unwrap();
    (report, engine.max_in_flight.load(Ordering::SeqCst))
}

#[tokio::test]
async fn test_parallel_rendering_keeps_cue_order() {
    let (report, max_in_flight) = run_parallel(0).await;
    assert_eq!(max_in_flight, 2);
    assert_eq!(speech_order(&report), vec![1, 2, 3, 4, 5]);
    let indices: Vec<usize> = report.segments.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    assert!((report.final_duration - 16.0).abs() < 0.02);
}

#[tokio::test]
async fn test_cooldown_chunks_bound_parallelism() {
    let (report, max_in_flight) = run_parallel(2).await;
    assert!(max_in_flight <= 2);
    assert_eq!(speech_order(&report), vec![1, 2, 3, 4, 5]);

    let (report, max_in_flight) = run_parallel(1).await;
    assert_eq!(max_in_flight, 1);
    assert_eq!(speech_order(&report), vec![1, 2, 3, 4, 5]);
    assert!(report.fallback_segments.is_empty());
}

#[tokio::test]
async fn test_quiet_track_raises_boost() {
    let fx = Fixture::new();
    let cues = fx.write_cues(TWO_CUES);
    let dubsync = fx.dubsync(ToneEngine::new(1.0), quiet());

    let report = dubsync.process(&cues, &fx.output(), Some(7.0)).await.unwrap();

    let step = fx.config.calibration.boost_step_db;
    assert!(!report.converged);
    assert_eq!(report.iterations.len(), 3);
    assert_eq!(report.iterations[0].boost_db, 0.0);
    assert_eq!(report.iterations[1].boost_db, step);
    assert_eq!(report.iterations[2].boost_db, 2.0 * step);
    // после последней итерации усиление не меняется
    assert_eq!(report.dynamic_boost_db, 2.0 * step);
}

#[tokio::test]
async fn test_boost_is_capped() {
    let mut fx = Fixture::new();
    fx.config.calibration.max_boost_db = 3.0;
    let cues = fx.write_cues(TWO_CUES);
    let dubsync = fx.dubsync(ToneEngine::new(1.0), quiet());

    let report = dubsync.process(&cues, &fx.output(), Some(7.0)).await.unwrap();

    let boosts: Vec<f64> = report.iterations.iter().map(|r| r.boost_db).collect();
    assert_eq!(boosts, vec![0.0, 2.0, 3.0]);
    assert_eq!(report.dynamic_boost_db, 3.0);
}

#[tokio::test]
async fn test_small_gaps_and_overlaps_emit_no_silence() {
    let fx = Fixture::new();
    let cues = fx.write_cues(
        "WEBVTT

00:00:00.000 --> 00:00:02.000
Hello there my friend

00:00:02.005 --> 00:00:04.005
World of many wonders

00:00:03.500 --> 00:00:05.500
Another line right here
",
    );
    let dubsync = fx.dubsync(ToneEngine::new(1.0), good());

    let report = dubsync.process(&cues, &fx.output(), Some(6.0)).await.unwrap();

    assert!(piece_seconds(&report, PieceKind::Leading).is_empty());
    assert!(piece_seconds(&report, PieceKind::Gap).is_empty());
    assert!(report.pieces.iter().all(|p| p.frames > 0));
    assert!((report.final_duration - 6.0).abs() < 0.02);
}

#[tokio::test]
async fn test_default_target_adds_trailing_pad() {
    let fx = Fixture::new();
    let cues = fx.write_cues(TWO_CUES);
    let dubsync = fx.dubsync(ToneEngine::new(1.0), good());

    let report = dubsync.process(&cues, &fx.output(), None).await.unwrap();
    let expected = 6.0 + fx.config.assembly.trailing_pad_secs;
    assert!((report.target_duration - expected).abs() < 1e-9);
    assert!((report.final_duration - expected).abs() < 0.02);
}

#[tokio::test]
async fn test_progress_updates_are_sent() {
    let fx = Fixture::new();
    let cues = fx.write_cues(TWO_CUES);
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let dubsync = fx.dubsync(ToneEngine::new(1.0), good()).with_progress(tx);

    dubsync.process(&cues, &fx.output(), Some(7.0)).await.unwrap();
    drop(dubsync);

    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }
    assert_eq!(updates.first(), Some(&ProgressUpdate::Started));
    assert_eq!(updates.get(1), Some(&ProgressUpdate::Parsed { segments: 2 }));
    let finished = updates
        .iter()
        .filter(|u| matches!(u, ProgressUpdate::SegmentFinished { .. }))
        .count();
    assert_eq!(finished, 2);
    assert!(matches!(updates.last(), Some(ProgressUpdate::Finished { .. })));
}

#[tokio::test]
async fn test_cancelled_run_returns_error() {
    let fx = Fixture::new();
    let cues = fx.write_cues(TWO_CUES);
    let engine = ToneEngine::new(1.0);
    let dubsync = fx.dubsync(engine.clone(), good());
    dubsync.cancellation_token().cancel();

    let err = dubsync.process(&cues, &fx.output(), Some(7.0)).await.unwrap_err();
    assert!(matches!(err, DubSyncError::Cancelled));
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    assert!(!fx.output().exists());
}

#[tokio::test]
async fn test_unparsable_cues_are_fatal() {
    let fx = Fixture::new();
    let cues = fx.write_cues("WEBVTT\n\nno timings here\n");
    let dubsync = fx.dubsync(ToneEngine::new(1.0), good());

    let err = dubsync.process(&cues, &fx.output(), Some(7.0)).await.unwrap_err();
    assert!(matches!(err, DubSyncError::MalformedCue(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_report_saves_json_and_text() {
    let fx = Fixture::new();
    let cues = fx.write_cues(TWO_CUES);
    let report = fx
        .dubsync(ToneEngine::new(1.0), good())
        .process(&cues, &fx.output(), Some(7.0))
        .await
        .unwrap();

    let json = fx.dir.path().join("report.json");
    let text = fx.dir.path().join("report.txt");
    report.save(&json).unwrap();
    report.save(&text).unwrap();

    let parsed: RunReport = serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
    assert_eq!(parsed.run_id, report.run_id);
    assert_eq!(parsed.segments.len(), 2);
    assert!(std::fs::read_to_string(&text).unwrap().contains("No fallback segments"));
}
