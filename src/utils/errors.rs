//! Sistema de manejo de errores
//!
//! Este módulo define todos los tipos de errores del pipeline de telemetría
//! y los helpers para construirlos con contexto acotado.

use thiserror::Error;

/// Longitud máxima del resumen textual de una respuesta upstream.
/// Los payloads completos nunca se propagan en errores ni logs.
pub const RESPONSE_SUMMARY_MAX_CHARS: usize = 240;

/// Errores principales del pipeline
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("External API error: {0}")]
    ExternalApi(String),

    #[error("Upstream authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Unexpected response shape: {0}")]
    UnexpectedResponse(String),

    #[error("Missing configuration keys: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Resultado tipado para operaciones que pueden fallar
pub type AppResult<T> = Result<T, AppError>;

/// Recorta una respuesta upstream a un resumen acotado para mensajes de error.
pub fn truncate_response(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= RESPONSE_SUMMARY_MAX_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(RESPONSE_SUMMARY_MAX_CHARS).collect();
        format!("{}…", cut)
    }
}

/// Función helper para errores de configuración con las claves faltantes enumeradas
pub fn configuration_error(missing: &[&str]) -> AppError {
    AppError::Configuration(missing.join(", "))
}

/// Función helper para errores de respuesta inesperada con resumen acotado
pub fn unexpected_response_error(context: &str, raw: &str) -> AppError {
    AppError::UnexpectedResponse(format!("{}: {}", context, truncate_response(raw)))
}
