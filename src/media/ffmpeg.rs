//! Модуль для работы с FFmpeg
//!
//! Транскодер поверх внешнего ffmpeg. Точная длина достигается фильтрами
//! `apad` + `atrim=end_sample=N`, поэтому результат совпадает со встроенным
//! транскодером до семпла.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::Semaphore;

use crate::error::{DubSyncError, Result};
use crate::media::{probe_wav, AudioFormat, Transcoder};
use crate::segment::AudioClip;
use crate::utils::process::{ensure_program, run_with_timeout};

pub struct FfmpegTranscoder {
    format: AudioFormat,
    program: String,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
}

impl FfmpegTranscoder {
    /// Создать транскодер; ffmpeg должен быть в PATH
    pub fn new(format: AudioFormat, timeout: Duration) -> Result<Self> {
        let program = ensure_program("ffmpeg")?;
        info!("Using ffmpeg at {}", program.display());
        let permits = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        Ok(Self {
            format,
            program: program.to_string_lossy().into_owned(),
            timeout,
            semaphore: Arc::new(Semaphore::new(permits)),
        })
    }

    fn layout(&self) -> &'static str {
        if self.format.channels == 1 { "mono" } else { "stereo" }
    }

    fn output_args(&self, output: &Path) -> Vec<String> {
        vec![
            "-ar".to_string(),
            self.format.sample_rate.to_string(),
            "-ac".to_string(),
            self.format.channels.to_string(),
            "-c:a".to_string(),
            "pcm_s16le".to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }

    async fn run(&self, args: Vec<String>, output: &Path) -> Result<AudioClip> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| DubSyncError::Transcoder(format!("Transcoder pool closed: {}", e)))?;

        let mut full = vec!["-y".to_string(), "-hide_banner".to_string(), "-loglevel".to_string(), "error".to_string()];
        full.extend(args);
        run_with_timeout(&self.program, &full, None, self.timeout).await?;
        probe_wav(output)
    }

    fn exact_length_filter(frames: u64) -> String {
        format!("apad,atrim=end_sample={}", frames)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Строка для concat demuxer; одинарные кавычки экранируются
pub fn concat_list_entry(path: &Path) -> String {
    format!("file '{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

/// Цепочка финальной обработки: усиление, шумоподавление, лимитер
pub fn polish_filter(boost_db: f64, frames: u64) -> String {
    format!(
        "volume={:.1}dB,afftdn=nf=-25,alimiter=limit=0.891:level=disabled,{}",
        boost_db,
        FfmpegTranscoder::exact_length_filter(frames)
    )
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn format(&self) -> AudioFormat {
        self.format
    }

    async fn silence(&self, frames: u64, output: &Path) -> Result<AudioClip> {
        let mut args = vec![
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("anullsrc=r={}:cl={}", self.format.sample_rate, self.layout()),
            "-af".to_string(),
            format!("atrim=end_sample={}", frames),
        ];
        args.extend(self.output_args(output));
        self.run(args, output).await
    }

    async fn conform(&self, input: &Path, output: &Path) -> Result<AudioClip> {
        let mut args = vec!["-i".to_string(), path_arg(input)];
        args.extend(self.output_args(output));
        self.run(args, output).await
    }

    async fn time_stretch(&self, input: &Path, frames: u64, output: &Path) -> Result<AudioClip> {
        let source = probe_wav(input)?;
        let target = self.format.seconds_for(frames);
        if source.duration <= 0.0 || target <= 0.0 {
            return Err(DubSyncError::AudioProcessing(format!(
                "Cannot stretch {} to {} frames",
                input.display(),
                frames
            )));
        }
        // atempo > 1 ускоряет
        let tempo = source.duration / target;
        debug!("atempo={:.4} for {}", tempo, input.display());

        let mut args = vec![
            "-i".to_string(),
            path_arg(input),
            "-af".to_string(),
            format!("atempo={:.6},{}", tempo, Self::exact_length_filter(frames)),
        ];
        args.extend(self.output_args(output));
        self.run(args, output).await
    }

    async fn fit(&self, input: &Path, frames: u64, output: &Path) -> Result<AudioClip> {
        let mut args = vec![
            "-i".to_string(),
            path_arg(input),
            "-af".to_string(),
            Self::exact_length_filter(frames),
        ];
        args.extend(self.output_args(output));
        self.run(args, output).await
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<AudioClip> {
        if inputs.is_empty() {
            return Err(DubSyncError::AssemblyEmpty);
        }
        let list = output.with_extension("concat.txt");
        let body = inputs
            .iter()
            .map(|p| concat_list_entry(p))
            .collect::<Vec<_>>()
            .join("\n");
        tokio::fs::write(&list, body).await?;

        let mut args = vec![
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            path_arg(&list),
        ];
        args.extend(self.output_args(output));
        let result = self.run(args, output).await;
        let _ = tokio::fs::remove_file(&list).await;
        result
    }

    async fn polish(&self, input: &Path, boost_db: f64, output: &Path) -> Result<AudioClip> {
        let source = probe_wav(input)?;
        let mut args = vec![
            "-i".to_string(),
            path_arg(input),
            "-af".to_string(),
            polish_filter(boost_db, source.frames()),
        ];
        args.extend(self.output_args(output));
        self.run(args, output).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_entry_escapes_quotes() {
        let entry = concat_list_entry(Path::new("/tmp/it's.wav"));
        assert_eq!(entry, "file '/tmp/it'\\''s.wav'");
    }

    #[test]
    fn test_polish_filter_keeps_length() {
        let filter = polish_filter(4.0, 48_000);
        assert!(filter.starts_with("volume=4.0dB"));
        assert!(filter.ends_with("atrim=end_sample=48000"));
    }

    #[tokio::test]
    async fn test_silence_when_ffmpeg_available() {
        if which::which("ffmpeg").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let t = FfmpegTranscoder::new(AudioFormat { sample_rate: 24_000, channels: 1 }, Duration::from_secs(30)).unwrap();
        let clip = t.silence(12_345, &dir.path().join("s.wav")).await.unwrap();
        assert_eq!(clip.frames(), 12_345);
    }
}
