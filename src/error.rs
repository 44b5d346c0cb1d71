//! Модуль обработки ошибок библиотеки dubsync
//!
//! Ошибки делятся на фатальные (нет ни одного сегмента, нечего собирать)
//! и восстановимые (таймаут синтеза, пустой вывод, сбой анализа), которые
//! поглощаются калибратором сегмента и никогда не прерывают прогон.

use std::time::Duration;
use thiserror::Error;

/// Ошибки библиотеки dubsync
#[derive(Debug, Error)]
pub enum DubSyncError {
    /// В файле субтитров не найдено ни одной пригодной реплики
    #[error("Malformed cue file: {0}")]
    MalformedCue(String),

    /// Синтезатор не уложился в отведённое время и был принудительно остановлен
    #[error("Synthesis timed out after {timeout:?}")]
    SynthesisTimeout { timeout: Duration },

    /// Синтезатор вернул пустой или подозрительно короткий клип
    #[error("Synthesis produced empty output: {0}")]
    SynthesisEmptyOutput(String),

    /// Синтезатор завершился с ошибкой
    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),

    /// Сборка не получила ни одного фрагмента
    #[error("Assembly produced no pieces")]
    AssemblyEmpty,

    /// Анализ аудио не удался (наружу не пробрасывается, см. `analysis`)
    #[error("Audio analysis failed: {0}")]
    AnalysisFailure(String),

    /// Ошибка обработки аудио
    #[error("Audio processing error: {0}")]
    AudioProcessing(String),

    /// Ошибка внешнего транскодера
    #[error("Transcoder error: {0}")]
    Transcoder(String),

    /// Ошибка конфигурации
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Файл не найден
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Прогон отменён между сегментами или итерациями
    #[error("Run cancelled")]
    Cancelled,

    /// Ошибка ввода-вывода
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Ошибка сериализации/десериализации JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Ошибка чтения или записи WAV
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// Ошибка HTTP запроса
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Другая ошибка
    #[error("Other error: {0}")]
    Other(String),
}

impl DubSyncError {
    /// Ошибки, после которых прогон не может выдать ни одной дорожки
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedCue(_)
                | Self::AssemblyEmpty
                | Self::Configuration(_)
                | Self::FileNotFound(_)
                | Self::Cancelled
        )
    }

    /// Ошибки, которые управляют повторными попытками синтеза
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SynthesisTimeout { .. }
                | Self::SynthesisEmptyOutput(_)
                | Self::SynthesisFailed(_)
                | Self::AnalysisFailure(_)
        )
    }
}

impl From<&str> for DubSyncError {
    fn from(s: &str) -> Self {
        DubSyncError::Other(s.to_string())
    }
}

impl From<String> for DubSyncError {
    fn from(s: String) -> Self {
        DubSyncError::Other(s)
    }
}

/// Тип Result для библиотеки dubsync
pub type Result<T> = std::result::Result<T, DubSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        assert!(DubSyncError::MalformedCue("empty".into()).is_fatal());
        assert!(DubSyncError::AssemblyEmpty.is_fatal());
        assert!(!DubSyncError::AssemblyEmpty.is_recoverable());

        let timeout = DubSyncError::SynthesisTimeout { timeout: Duration::from_secs(5) };
        assert!(timeout.is_recoverable());
        assert!(!timeout.is_fatal());
        assert!(DubSyncError::SynthesisEmptyOutput("0 bytes".into()).is_recoverable());
        assert!(DubSyncError::AnalysisFailure("crash".into()).is_recoverable());
    }

    #[test]
    fn test_string_conversion() {
        let err: DubSyncError = "boom".into();
        assert_eq!(err.to_string(), "Other error: boom");
    }
}
