//! Sink de notificaciones
//!
//! El canal de entrega real (chat de operaciones) es un colaborador externo;
//! este módulo define el seam y un sink por defecto que solo loguea.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Destino fire-and-forget de mensajes de canal con metadata estructurada.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_channel_message(&self, channel: &str, text: &str, metadata: Value) -> Result<()>;
}

/// Sink por defecto: deja el mensaje en el log del proceso.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn send_channel_message(&self, channel: &str, text: &str, metadata: Value) -> Result<()> {
        log::info!("📢 [{}] {}", channel, text);
        log::debug!("📢 metadata: {}", metadata);
        Ok(())
    }
}
