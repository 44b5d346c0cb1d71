//! Модуль для парсинга файлов субтитров
//!
//! Поддерживаются метки времени с часами (`00:01:02.500`) и без них
//! (`01:02.500`), с точкой или запятой перед долями секунды, то есть и
//! WebVTT, и SRT. Грамматика выбирается автоматически: берётся первая,
//! которая нашла в файле хотя бы одну строку тайминга.

use std::fs;
use std::path::Path;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::error::{DubSyncError, Result};
use crate::segment::TimedSegment;
use crate::subtitle::normalizer::normalize;

/// Грамматика меток времени
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueGrammar {
    /// `HH:MM:SS.mmm` или `HH:MM:SS,mmm`
    Hours,
    /// `MM:SS.mmm` или `MM:SS,mmm`
    Minutes,
}

static HOURS_TIMING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(\d+):(\d{2}):(\d{2})[.,](\d{1,3})\s*-->\s*(\d+):(\d{2}):(\d{2})[.,](\d{1,3})",
    )
    .expect("valid hours timing regex")
});

static MINUTES_TIMING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d{1,2}):(\d{2})[.,](\d{1,3})\s*-->\s*(\d{1,2}):(\d{2})[.,](\d{1,3})")
        .expect("valid minutes timing regex")
});

impl CueGrammar {
    /// Грамматики в порядке проверки
    pub const ALL: [CueGrammar; 2] = [CueGrammar::Hours, CueGrammar::Minutes];

    fn regex(self) -> &'static Regex {
        match self {
            Self::Hours => &HOURS_TIMING,
            Self::Minutes => &MINUTES_TIMING,
        }
    }

    /// Разобрать строку тайминга, вернуть (начало, конец) в секундах
    pub fn parse_timing(self, line: &str) -> Option<(f64, f64)> {
        let caps = self.regex().captures(line)?;
        match self {
            Self::Hours => Some((timestamp_secs(&caps, 1, true)?, timestamp_secs(&caps, 5, true)?)),
            Self::Minutes => Some((timestamp_secs(&caps, 1, false)?, timestamp_secs(&caps, 4, false)?)),
        }
    }
}

/// Собирает секунды из групп захвата, начиная с группы `first`
fn timestamp_secs(caps: &Captures, first: usize, with_hours: bool) -> Option<f64> {
    let (hours, rest) = if with_hours {
        (caps.get(first)?.as_str().parse::<u64>().ok()?, first + 1)
    } else {
        (0, first)
    };
    let minutes = caps.get(rest)?.as_str().parse::<u64>().ok()?;
    let seconds = caps.get(rest + 1)?.as_str().parse::<u64>().ok()?;
    let fraction = caps.get(rest + 2)?.as_str();
    let millis = fraction.parse::<u64>().ok()? * 10_u64.pow(3 - fraction.len() as u32);

    Some((hours * 3600 + minutes * 60 + seconds) as f64 + millis as f64 / 1000.0)
}

/// Определить грамматику меток времени по содержимому файла
pub fn detect_grammar(content: &str) -> Option<CueGrammar> {
    CueGrammar::ALL
        .into_iter()
        .find(|grammar| content.lines().any(|line| grammar.regex().is_match(line)))
}

/// Разобрать содержимое файла субтитров в упорядоченный список сегментов
pub fn parse_cues(content: &str) -> Result<Vec<TimedSegment>> {
    let content = content.trim_start_matches('\u{feff}');
    let grammar = detect_grammar(content).ok_or_else(|| {
        DubSyncError::MalformedCue("no timing lines matched any supported grammar".to_string())
    })?;
    debug!("Detected cue grammar: {:?}", grammar);

    let mut segments = Vec::new();
    let mut block: Vec<&str> = Vec::new();
    let mut dropped = 0usize;

    let lines = content.lines().chain(std::iter::once(""));
    for line in lines {
        if !line.trim().is_empty() {
            block.push(line);
            continue;
        }
        if block.is_empty() {
            continue;
        }

        match parse_block(grammar, &block, segments.len() + 1) {
            Some(segment) => segments.push(segment),
            None => dropped += 1,
        }
        block.clear();
    }

    if segments.is_empty() {
        return Err(DubSyncError::MalformedCue(format!(
            "no usable cues found ({} blocks dropped)",
            dropped
        )));
    }

    info!("Parsed {} segments ({} blocks skipped)", segments.len(), dropped);
    Ok(segments)
}

/// Разобрать один блок; None для заголовков, комментариев и пустых реплик
fn parse_block(grammar: CueGrammar, block: &[&str], index: usize) -> Option<TimedSegment> {
    let timing_pos = block.iter().position(|line| grammar.regex().is_match(line))?;
    let (start, end) = grammar.parse_timing(block[timing_pos])?;

    let raw_text = block[timing_pos + 1..]
        .iter()
        .map(|line| line.trim())
        .collect::<Vec<&str>>()
        .join(" ");

    if end - start <= 0.0 {
        debug!("Skipping cue at {:.3}s with non-positive duration", start);
        return None;
    }

    let normalized = normalize(&raw_text);
    if normalized.is_empty() {
        debug!("Skipping cue at {:.3}s with no speakable text: {:?}", start, raw_text);
        return None;
    }

    Some(TimedSegment::new(index, start, end, raw_text, normalized))
}

/// Прочитать и разобрать файл субтитров
pub fn parse_cue_file<P: AsRef<Path>>(path: P) -> Result<Vec<TimedSegment>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        DubSyncError::FileNotFound(format!("Failed to open cue file {}: {}", path.display(), e))
    })?;
    parse_cues(&content)
}
