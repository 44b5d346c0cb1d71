//! Синтез через HTTP-сервис
//!
//! POST JSON `{text, voice_id, length_scale, format}`, в ответ - аудио.
//! Если сервис вернул mp3, файл сохраняется с расширением `.mp3`.

use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::{debug, error};
use reqwest::Client;
use serde::Serialize;

use crate::error::{DubSyncError, Result};
use crate::tts::{SpeechEngine, SynthesisRequest};

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
    length_scale: f64,
    format: &'a str,
}

pub struct HttpSynthesizer {
    endpoint: String,
    client: Client,
}

impl HttpSynthesizer {
    pub fn new(endpoint: String) -> Result<Self> {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(DubSyncError::Configuration(format!("Invalid synthesis endpoint: {}", endpoint)));
        }
        let client = Client::builder()
            .user_agent(concat!("dubsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { endpoint, client })
    }
}

/// Расширение файла по Content-Type ответа
fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type {
        Some(ct) if ct.contains("mpeg") || ct.contains("mp3") => "mp3",
        Some(ct) if ct.contains("aac") || ct.contains("mp4") => "m4a",
        _ => "wav",
    }
}

#[async_trait]
impl SpeechEngine for HttpSynthesizer {
    async fn render(&self, request: &SynthesisRequest, output: &Path) -> Result<PathBuf> {
        let body = ApiRequest {
            text: &request.text,
            voice_id: &request.voice,
            length_scale: request.length_scale,
            format: "wav",
        };
        debug!("POST {} ({} chars)", self.endpoint, request.text.len());

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| DubSyncError::SynthesisFailed(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("Synthesis service returned {}: {}", status, text);
            return Err(DubSyncError::SynthesisFailed(format!("HTTP {}: {}", status, text)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DubSyncError::SynthesisFailed(format!("Failed to read audio: {}", e)))?;

        let path = output.with_extension(extension_for(content_type.as_deref()));
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }

    fn name(&self) -> String {
        format!("http:{}", self.endpoint)
    }
}
