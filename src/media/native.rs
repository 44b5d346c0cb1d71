//! Встроенный транскодер на hound и Rubato
//!
//! Работает с PCM в памяти, поэтому длительности получаются точными до
//! семпла. Частота меняется ресемплингом Rubato, темп меняется WSOLA без
//! сдвига высоты тона. Тяжёлые операции выполняются в пуле блокирующих задач.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use log::debug;
use tokio::sync::Semaphore;

use crate::error::{DubSyncError, Result};
use crate::media::pcm::{self, amplitude_to_db, compute_rms, db_to_gain, PcmBuffer};
use crate::media::{probe_wav, AudioFormat, Transcoder};
use crate::segment::AudioClip;

/// Порог шумового гейта, dBFS
const GATE_THRESHOLD_DB: f64 = -55.0;
/// Ослабление фреймов ниже порога гейта
const GATE_ATTENUATION: f32 = 0.3;
/// Порог мягкого лимитера (-1 dBFS)
const LIMITER_THRESHOLD: f32 = 0.891;
/// Потолок лимитера, ниже уровня, который анализатор считает клиппингом
const LIMITER_CEILING: f32 = 0.98;

pub struct NativeTranscoder {
    format: AudioFormat,
    semaphore: Arc<Semaphore>,
}

impl NativeTranscoder {
    pub fn new(format: AudioFormat) -> Self {
        let permits = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        Self {
            format,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Выполнить CPU-работу в блокирующем пуле под семафором транскодера
    async fn run_blocking<F>(&self, job: F) -> Result<AudioClip>
    where
        F: FnOnce() -> Result<AudioClip> + Send + 'static,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| DubSyncError::Transcoder(format!("Transcoder pool closed: {}", e)))?;

        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| DubSyncError::Transcoder(format!("Transcoder task panicked: {}", e)))?
    }
}

fn load_conformed(path: &Path, format: AudioFormat) -> Result<PcmBuffer> {
    let buffer = pcm::decode_audio_file(path)?;
    buffer.conform(format.sample_rate, format.channels)
}

fn write_clip(buffer: &PcmBuffer, output: &Path) -> Result<AudioClip> {
    pcm::encode_wav(buffer, output)?;
    probe_wav(output)
}

/// Гейт по 10 мс фреймам и мягкий лимитер, длина буфера не меняется
pub fn polish_buffer(buffer: &mut PcmBuffer, boost_db: f64) {
    let gain = db_to_gain(boost_db);
    for sample in buffer.samples.iter_mut() {
        *sample *= gain;
    }

    let frame_len = ((buffer.sample_rate as usize / 100).max(1)) * buffer.channels.max(1) as usize;
    for frame in buffer.samples.chunks_mut(frame_len) {
        if amplitude_to_db(compute_rms(frame)) < GATE_THRESHOLD_DB {
            for sample in frame.iter_mut() {
                *sample *= GATE_ATTENUATION;
            }
        }
    }

    let headroom = LIMITER_CEILING - LIMITER_THRESHOLD;
    for sample in buffer.samples.iter_mut() {
        let magnitude = sample.abs();
        if magnitude > LIMITER_THRESHOLD {
            let limited = LIMITER_THRESHOLD + headroom * ((magnitude - LIMITER_THRESHOLD) / headroom).tanh();
            *sample = limited.min(LIMITER_CEILING).copysign(*sample);
        }
    }
}

#[async_trait]
impl Transcoder for NativeTranscoder {
    fn format(&self) -> AudioFormat {
        self.format
    }

    async fn silence(&self, frames: u64, output: &Path) -> Result<AudioClip> {
        let format = self.format;
        let output = output.to_path_buf();
        self.run_blocking(move || {
            let buffer = PcmBuffer::silence(frames, format.sample_rate, format.channels);
            write_clip(&buffer, &output)
        })
        .await
    }

    async fn conform(&self, input: &Path, output: &Path) -> Result<AudioClip> {
        let format = self.format;
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        self.run_blocking(move || {
            let buffer = load_conformed(&input, format)?;
            write_clip(&buffer, &output)
        })
        .await
    }

    async fn time_stretch(&self, input: &Path, frames: u64, output: &Path) -> Result<AudioClip> {
        let format = self.format;
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        self.run_blocking(move || {
            let buffer = load_conformed(&input, format)?;
            if buffer.frames() == 0 {
                return Err(DubSyncError::AudioProcessing(format!(
                    "Cannot stretch empty clip {}",
                    input.display()
                )));
            }
            let ratio = frames as f64 / buffer.frames() as f64;
            debug!("Stretching {} by {:.3} to {} frames", input.display(), ratio, frames);
            let stretched = pcm::stretch_preserving_pitch(&buffer, frames);
            write_clip(&stretched, &output)
        })
        .await
    }

    async fn fit(&self, input: &Path, frames: u64, output: &Path) -> Result<AudioClip> {
        let format = self.format;
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        self.run_blocking(move || {
            let mut buffer = load_conformed(&input, format)?;
            buffer.fit_frames(frames);
            write_clip(&buffer, &output)
        })
        .await
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<AudioClip> {
        let format = self.format;
        let inputs = inputs.to_vec();
        let output = output.to_path_buf();
        self.run_blocking(move || {
            let mut joined = PcmBuffer::new(Vec::new(), format.sample_rate, format.channels);
            for input in &inputs {
                let piece = load_conformed(input, format)?;
                joined.append(&piece)?;
            }
            write_clip(&joined, &output)
        })
        .await
    }

    async fn polish(&self, input: &Path, boost_db: f64, output: &Path) -> Result<AudioClip> {
        let format = self.format;
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        self.run_blocking(move || {
            let mut buffer = load_conformed(&input, format)?;
            polish_buffer(&mut buffer, boost_db);
            write_clip(&buffer, &output)
        })
        .await
    }
}
