//! Модуль для отслеживания прогресса калибровки
//!
//! Обновления уходят в необязательный канал tokio; если получатель
//! отвалился, прогон продолжается.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

/// Обновление прогресса для отправки клиенту
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressUpdate {
    /// Началась обработка
    Started,
    /// Разобраны субтитры
    Parsed { segments: usize },
    /// Началась итерация глобальной калибровки
    IterationStarted { iteration: u32, max_iterations: u32, global_scale: f64 },
    /// Сегмент завершён (принят или заменён тишиной)
    SegmentFinished { index: usize, total: usize, accepted: bool, attempts: u32 },
    /// Склейка дорожки
    Assembling { iteration: u32 },
    /// Итерация оценена
    IterationFinished { iteration: u32, precision: f64, quality: f64 },
    /// Обработка завершена
    Finished { precision: f64, quality: f64 },
}

/// Асинхронно отправляет обновление прогресса
pub async fn send_progress(sender: &Option<Sender<ProgressUpdate>>, update: ProgressUpdate) {
    if let Some(sender) = sender {
        let _ = sender.send(update).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_progress() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let sender = Some(tx);
        send_progress(&sender, ProgressUpdate::Started).await;
        assert_eq!(rx.recv().await, Some(ProgressUpdate::Started));

        drop(rx);
        // закрытый канал не роняет прогон
        send_progress(&sender, ProgressUpdate::Parsed { segments: 1 }).await;
        send_progress(&None, ProgressUpdate::Started).await;
    }
}
