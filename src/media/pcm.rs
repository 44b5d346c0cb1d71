//! # PCM
//!
//! Буфер PCM-семплов и ввод-вывод аудиофайлов.
//!
//! - WAV читается и пишется через hound (16 бит целые или 32 бита float)
//! - остальные форматы (mp3, aac) декодируются через Symphonia
//! - смена частоты и растяжение выполняются Rubato (sinc-интерполяция)

use std::fs::File;
use std::path::Path;
use log::{debug, warn};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{DubSyncError, Result};

/// Перемежённые PCM-семплы в диапазоне [-1.0, 1.0]
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self { samples, sample_rate, channels }
    }

    /// Тишина ровно из `frames` фреймов
    pub fn silence(frames: u64, sample_rate: u32, channels: u16) -> Self {
        Self::new(vec![0.0; frames as usize * channels as usize], sample_rate, channels)
    }

    /// Количество фреймов
    pub fn frames(&self) -> u64 {
        if self.channels == 0 {
            return 0;
        }
        (self.samples.len() / self.channels as usize) as u64
    }

    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Смешать каналы в моно
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }

    /// Привести к заданному числу каналов
    pub fn with_channels(&self, channels: u16) -> PcmBuffer {
        if channels == self.channels {
            return self.clone();
        }
        let mono = self.to_mono();
        let samples = if channels == 1 {
            mono
        } else {
            mono.iter()
                .flat_map(|&s| std::iter::repeat(s).take(channels as usize))
                .collect()
        };
        PcmBuffer::new(samples, self.sample_rate, channels)
    }

    /// Привести к нужной частоте и числу каналов
    pub fn conform(&self, sample_rate: u32, channels: u16) -> Result<PcmBuffer> {
        let rechanneled = self.with_channels(channels);
        if rechanneled.sample_rate == sample_rate {
            return Ok(rechanneled);
        }
        let target_frames =
            (rechanneled.frames() as f64 * sample_rate as f64 / rechanneled.sample_rate as f64).round() as u64;
        let ratio = sample_rate as f64 / rechanneled.sample_rate as f64;
        let mut converted = resample_to_frames(&rechanneled, ratio, target_frames)?;
        converted.sample_rate = sample_rate;
        Ok(converted)
    }

    /// Обрезать или дополнить тишиной до ровно `frames` фреймов
    pub fn fit_frames(&mut self, frames: u64) {
        let len = frames as usize * self.channels as usize;
        self.samples.resize(len, 0.0);
    }

    /// Дописать другой буфер того же формата
    pub fn append(&mut self, other: &PcmBuffer) -> Result<()> {
        if other.sample_rate != self.sample_rate || other.channels != self.channels {
            return Err(DubSyncError::AudioProcessing(format!(
                "Format mismatch on concat: {} Hz/{} ch vs {} Hz/{} ch",
                self.sample_rate, self.channels, other.sample_rate, other.channels
            )));
        }
        self.samples.extend_from_slice(&other.samples);
        Ok(())
    }
}

/// Среднеквадратичное значение
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Амплитуда в децибелы относительно полной шкалы, снизу ограничено -90 dB
pub fn amplitude_to_db(amplitude: f32) -> f64 {
    if amplitude <= 0.0 {
        return -90.0;
    }
    (20.0 * (amplitude as f64).log10()).max(-90.0)
}

pub fn db_to_gain(db: f64) -> f32 {
    10f64.powf(db / 20.0) as f32
}

/// Записать буфер в WAV (16 бит)
pub fn encode_wav<P: AsRef<Path>>(buffer: &PcmBuffer, path: P) -> Result<()> {
    let spec = WavSpec {
        channels: buffer.channels,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path.as_ref(), spec)?;
    for &sample in &buffer.samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clamped * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Прочитать WAV файл
pub fn decode_wav_file<P: AsRef<Path>>(path: P) -> Result<PcmBuffer> {
    let mut reader = WavReader::open(path.as_ref())?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    Ok(PcmBuffer::new(samples, spec.sample_rate, spec.channels))
}

/// Прочитать длительность WAV по заголовку, не декодируя семплы
pub fn wav_duration<P: AsRef<Path>>(path: P) -> Result<(f64, u32, u16)> {
    let reader = WavReader::open(path.as_ref())?;
    let spec = reader.spec();
    let frames = reader.duration();
    Ok((frames as f64 / spec.sample_rate as f64, spec.sample_rate, spec.channels))
}

/// Декодировать аудиофайл любого поддерживаемого формата
pub fn decode_audio_file<P: AsRef<Path>>(path: P) -> Result<PcmBuffer> {
    let path = path.as_ref();
    if is_wav(path) {
        return decode_wav_file(path);
    }

    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DubSyncError::AudioProcessing(format!("Unsupported audio format: {}", e)))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| DubSyncError::AudioProcessing("No audio track found".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DubSyncError::AudioProcessing(format!("Failed to create decoder: {}", e)))?;

    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track.codec_params.channels.map(|c| c.count() as u16).unwrap_or(0);
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                debug!("Stopping decode of {}: {}", path.display(), e);
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count() as u16;
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping undecodable packet in {}: {}", path.display(), e);
            }
            Err(e) => {
                return Err(DubSyncError::AudioProcessing(format!("Decode failed: {}", e)));
            }
        }
    }

    if sample_rate == 0 || channels == 0 {
        return Err(DubSyncError::AudioProcessing(format!(
            "Could not determine audio format of {}",
            path.display()
        )));
    }

    Ok(PcmBuffer::new(samples, sample_rate, channels))
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

/// Ресемплинг через Rubato с точным количеством фреймов на выходе.
///
/// `ratio` - отношение выходной частоты к входной (>1 удлиняет буфер).
/// Последний блок дополняется нулями, результат обрезается до `target_frames`.
pub fn resample_to_frames(buffer: &PcmBuffer, ratio: f64, target_frames: u64) -> Result<PcmBuffer> {
    let channels = buffer.channels.max(1) as usize;
    let frames = buffer.frames() as usize;
    if frames == 0 || target_frames == 0 {
        return Ok(PcmBuffer::silence(target_frames, buffer.sample_rate, buffer.channels));
    }

    let chunk_size = if frames < 4096 { 256 } else { 1024 };
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, chunk_size, channels)
        .map_err(|e| DubSyncError::AudioProcessing(format!("Rubato init failed: {}", e)))?;

    // деинтерливинг
    let mut planar: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels];
    for frame in buffer.samples.chunks(channels) {
        for (ch, &s) in frame.iter().enumerate() {
            planar[ch].push(s);
        }
    }

    let target = target_frames as usize;
    let delay = resampler.output_delay();
    let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(target + chunk_size); channels];
    let mut pos = 0;
    // после конца входа подаём тишину, пока не вытолкнем задержку фильтра
    while output[0].len() < target + delay {
        let chunk: Vec<Vec<f32>> = planar
            .iter()
            .map(|ch| {
                let mut block = vec![0.0f32; chunk_size];
                if pos < ch.len() {
                    let end = (pos + chunk_size).min(ch.len());
                    block[..end - pos].copy_from_slice(&ch[pos..end]);
                }
                block
            })
            .collect();
        pos += chunk_size;

        let processed = resampler
            .process(&chunk, None)
            .map_err(|e| DubSyncError::AudioProcessing(format!("Rubato process failed: {}", e)))?;
        for (ch, data) in processed.into_iter().enumerate() {
            output[ch].extend(data);
        }

        if pos > frames + chunk_size * 8 + (target as f64 / ratio) as usize {
            break;
        }
    }

    // компенсация задержки sinc-фильтра
    let mut samples = Vec::with_capacity(target * channels);
    for i in 0..target {
        for ch in output.iter() {
            samples.push(ch.get(i + delay).copied().unwrap_or(0.0));
        }
    }

    Ok(PcmBuffer::new(samples, buffer.sample_rate, buffer.channels))
}

/// Окно WSOLA
const WSOLA_WINDOW_SECS: f64 = 0.02;
/// Радиус поиска сдвига окна
const WSOLA_SEEK_SECS: f64 = 0.01;

/// Изменение темпа без сдвига высоты тона (WSOLA, как `setTempo` в SoundTouch).
///
/// Окна Ханна с перекрытием 50% выкладываются на выход с шагом `hop`, а во
/// входе берутся с шагом `hop / ratio`. Начало каждого окна уточняется в
/// пределах `WSOLA_SEEK_SECS` по максимуму корреляции с естественным
/// продолжением предыдущего окна. На выходе ровно `target_frames` фреймов.
pub fn stretch_preserving_pitch(buffer: &PcmBuffer, target_frames: u64) -> PcmBuffer {
    let channels = buffer.channels.max(1) as usize;
    let frames = buffer.frames() as usize;
    let target = target_frames as usize;
    let window = ((buffer.sample_rate as f64 * WSOLA_WINDOW_SECS) as usize / 2 * 2).max(2);
    if frames < window * 2 || target == 0 {
        let mut copy = buffer.clone();
        copy.fit_frames(target_frames);
        return copy;
    }

    let hop = window / 2;
    let seek = (buffer.sample_rate as f64 * WSOLA_SEEK_SECS) as usize;
    let analysis_hop = hop as f64 * frames as f64 / target as f64;
    let last_start = frames - window;
    let hann: Vec<f32> = (0..window)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / window as f32).cos())
        .collect();
    let mono = buffer.to_mono();

    let mut out = vec![0.0f32; (target + window) * channels];
    let mut weight = vec![0.0f32; target + window];
    let mut previous: Option<usize> = None;
    let mut k = 0usize;
    while k * hop < target {
        let out_pos = k * hop;
        let nominal = ((k as f64 * analysis_hop).round() as usize).min(last_start);
        let pos = match previous.map(|p| p + hop).filter(|&natural| natural <= last_start) {
            Some(natural) => best_overlap(
                &mono,
                natural,
                nominal.saturating_sub(seek),
                (nominal + seek).min(last_start),
                window,
            ),
            None => nominal,
        };
        for (i, &w) in hann.iter().enumerate() {
            weight[out_pos + i] += w;
            let src = (pos + i) * channels;
            let dst = (out_pos + i) * channels;
            for ch in 0..channels {
                out[dst + ch] += buffer.samples[src + ch] * w;
            }
        }
        previous = Some(pos);
        k += 1;
    }

    for (frame, &w) in out.chunks_mut(channels).zip(weight.iter()) {
        if w > 1e-3 {
            for sample in frame.iter_mut() {
                *sample /= w;
            }
        }
    }
    out.truncate(target * channels);
    PcmBuffer::new(out, buffer.sample_rate, buffer.channels)
}

/// Начало окна в `[lo, hi]`, лучше всего совпадающее с окном на `natural`
fn best_overlap(mono: &[f32], natural: usize, lo: usize, hi: usize, window: usize) -> usize {
    let reference = &mono[natural..natural + window];
    let mut best = (lo, f32::MIN);
    for start in lo..=hi {
        let score: f32 = mono[start..start + window]
            .iter()
            .zip(reference)
            .step_by(2)
            .map(|(a, b)| a * b)
            .sum();
        if score > best.1 {
            best = (start, score);
        }
    }
    best.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, secs: f64, rate: u32) -> PcmBuffer {
        let n = (secs * rate as f64) as usize;
        let samples = (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect();
        PcmBuffer::new(samples, rate, 1)
    }

    #[test]
    fn test_silence_exact() {
        let a = PcmBuffer::silence(24_000, 24_000, 1);
        let b = PcmBuffer::silence(24_000, 24_000, 1);
        assert_eq!(a.frames(), b.frames());
        assert_eq!(a.duration(), 1.0);
        assert!(a.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_wav_round_trip_preserves_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let tone = sine(440.0, 0.5, 16_000);
        encode_wav(&tone, &path).unwrap();

        let decoded = decode_audio_file(&path).unwrap();
        assert_eq!(decoded.frames(), tone.frames());
        assert_eq!(decoded.sample_rate, 16_000);
        let (duration, rate, channels) = wav_duration(&path).unwrap();
        assert!((duration - 0.5).abs() < 1e-6);
        assert_eq!((rate, channels), (16_000, 1));
    }

    #[test]
    fn test_conform_changes_rate_and_channels() {
        let tone = sine(300.0, 1.0, 22_050).with_channels(2);
        assert_eq!(tone.channels, 2);
        let conformed = tone.conform(24_000, 1).unwrap();
        assert_eq!(conformed.channels, 1);
        assert_eq!(conformed.sample_rate, 24_000);
        assert_eq!(conformed.frames(), 24_000);
    }

    #[test]
    fn test_resample_exact_length() {
        let tone = sine(200.0, 0.75, 24_000);
        let stretched = resample_to_frames(&tone, 1.2, 21_600).unwrap();
        assert_eq!(stretched.frames(), 21_600);
        let rms = compute_rms(&stretched.samples);
        assert!(rms > 0.2, "stretched tone lost energy: {}", rms);
    }

    fn rising_crossings(samples: &[f32]) -> usize {
        samples.windows(2).filter(|w| w[0] < 0.0 && w[1] >= 0.0).count()
    }

    #[test]
    fn test_tempo_change_keeps_pitch() {
        let tone = sine(220.0, 1.0, 24_000);
        let stretched = stretch_preserving_pitch(&tone, 28_800);
        assert_eq!(stretched.frames(), 28_800);

        // 220 Гц остаются 220 Гц, а не 183 Гц, как после ресемплинга
        let hz = rising_crossings(&stretched.samples) as f64 / stretched.duration();
        assert!((hz - 220.0).abs() < 220.0 * 0.03, "{}", hz);
        let rms = compute_rms(&stretched.samples);
        assert!(rms > 0.3, "stretched tone lost energy: {}", rms);

        let squeezed = stretch_preserving_pitch(&tone, 20_000);
        assert_eq!(squeezed.frames(), 20_000);
        let hz = rising_crossings(&squeezed.samples) as f64 / squeezed.duration();
        assert!((hz - 220.0).abs() < 220.0 * 0.03, "{}", hz);
    }

    #[test]
    fn test_tempo_change_of_tiny_clip_pads() {
        let tone = sine(220.0, 0.01, 24_000);
        let stretched = stretch_preserving_pitch(&tone.with_channels(2), 300);
        assert_eq!(stretched.frames(), 300);
        assert_eq!(stretched.channels, 2);
    }

    #[test]
    fn test_append_rejects_mismatch() {
        let mut a = PcmBuffer::silence(10, 24_000, 1);
        let b = PcmBuffer::silence(10, 16_000, 1);
        assert!(a.append(&b).is_err());
        let c = PcmBuffer::silence(5, 24_000, 1);
        a.append(&c).unwrap();
        assert_eq!(a.frames(), 15);
    }

    #[test]
    fn test_db_conversions() {
        assert_eq!(amplitude_to_db(0.0), -90.0);
        assert!((amplitude_to_db(1.0)).abs() < 1e-9);
        assert!((db_to_gain(6.0) - 1.995).abs() < 0.01);
    }
}
