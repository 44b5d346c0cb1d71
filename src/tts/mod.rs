//! Модуль синтеза речи
//!
//! `SpeechEngine` - граница с внешним синтезатором: запрос из текста,
//! масштаба длительности и голоса, ответ в виде аудиофайла. Таймаут,
//! пул и проверка результата живут в `SynthesisAdapter`.

pub mod adapter;
pub mod command;
pub mod http;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;

use crate::config::{EngineConfig, SynthesisConfig};
use crate::error::Result;

pub use adapter::SynthesisAdapter;
pub use command::CommandSynthesizer;
pub use http::HttpSynthesizer;

/// Запрос на синтез одной реплики
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    /// Множитель длительности: больше 1 - медленнее и длиннее
    pub length_scale: f64,
    pub voice: String,
}

/// Внешний движок синтеза речи
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Записать речь в `output` (или рядом, с другим расширением) и вернуть путь
    async fn render(&self, request: &SynthesisRequest, output: &Path) -> Result<PathBuf>;

    /// Имя движка для логов и ключа кэша
    fn name(&self) -> String;
}

/// Создать движок по конфигурации
pub fn create_engine(config: &SynthesisConfig) -> Result<Arc<dyn SpeechEngine>> {
    match &config.engine {
        EngineConfig::Command { program, args } => {
            Ok(Arc::new(CommandSynthesizer::new(program.clone(), args.clone())?))
        }
        EngineConfig::Http { endpoint } => Ok(Arc::new(HttpSynthesizer::new(endpoint.clone())?)),
    }
}
