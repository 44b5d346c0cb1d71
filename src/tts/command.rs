//! Синтез через локальную программу (piper и похожие)
//!
//! Текст подаётся в stdin, в аргументах подставляются `{voice}`,
//! `{length_scale}` и `{output}`. Таймаут и убийство процесса выполняет
//! адаптер: при отмене future дочерний процесс умирает вместе с ней.

use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use log::debug;

use crate::error::{DubSyncError, Result};
use crate::tts::{SpeechEngine, SynthesisRequest};
use crate::utils::process::{ensure_program, run_with_timeout, ProcessError};

/// Верхняя граница для самого процесса; реальный таймаут задаёт адаптер
const PROCESS_CEILING: Duration = Duration::from_secs(3600);

pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
}

impl CommandSynthesizer {
    pub fn new(program: String, args: Vec<String>) -> Result<Self> {
        let resolved = ensure_program(&program)?;
        Ok(Self {
            program: resolved.to_string_lossy().into_owned(),
            args,
        })
    }

    /// Создать без проверки PATH (для программ, которые появятся позже)
    pub fn unchecked(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Подставить параметры запроса в шаблон аргументов
    pub fn expand_args(&self, request: &SynthesisRequest, output: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{voice}", &request.voice)
                    .replace("{length_scale}", &format!("{:.3}", request.length_scale))
                    .replace("{output}", &output.to_string_lossy())
            })
            .collect()
    }
}

#[async_trait]
impl SpeechEngine for CommandSynthesizer {
    async fn render(&self, request: &SynthesisRequest, output: &Path) -> Result<PathBuf> {
        let args = self.expand_args(request, output);
        debug!("Synthesizing {:?} with length_scale {:.3}", request.text, request.length_scale);

        run_with_timeout(&self.program, &args, Some(&request.text), PROCESS_CEILING)
            .await
            .map_err(|e| match e {
                ProcessError::Timeout { timeout, .. } => DubSyncError::SynthesisTimeout { timeout },
                other => DubSyncError::SynthesisFailed(other.to_string()),
            })?;

        Ok(output.to_path_buf())
    }

    fn name(&self) -> String {
        format!("command:{}", self.program)
    }
}
