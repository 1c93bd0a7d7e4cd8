//! Extracción y caché del token de sesión
//!
//! El endpoint InitializeSession del upstream responde con formas
//! impredecibles: JSON con varios nombres de clave posibles, XML/texto con
//! varios marcadores, o un string pelado tipo UUID. Este módulo aísla la
//! heurística de extracción en una función pura y mantiene el caché de token
//! con TTL fijo conservador, independiente de lo que declare el servidor.

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

/// TTL fijo del token de sesión (20 minutos), independiente de cualquier
/// expiración declarada por el servidor.
pub const TOKEN_TTL_SECS: i64 = 20 * 60;

/// Margen de refresco: el token se considera vencido cuando le queda menos
/// de este remanente.
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Claves JSON candidatas, en orden de preferencia.
const JSON_TOKEN_KEYS: &[&str] = &["success", "token", "sessionid", "session_id", "result", "value", "d"];

lazy_static! {
    static ref UUID_RE: Regex = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
    )
    .unwrap();
    static ref XML_TOKEN_RE: Regex = Regex::new(
        r"(?is)<(?:token|success|sessionid|string)[^>]*>\s*([^<>]+?)\s*</\s*(?:token|success|sessionid|string)\s*>"
    )
    .unwrap();
}

/// Extrae el token de sesión de una respuesta cruda.
///
/// Prueba en orden: claves JSON candidatas → patrones de tag XML →
/// heurísticas de string pelado (UUID, o "parece un id opaco": longitud
/// ≥ 12 y no empieza con corchete/llave/ángulo). La heurística de id opaco
/// es deliberadamente amplia y puede clasificar texto de error como token;
/// se mantiene así porque el upstream nunca documentó el formato.
pub fn extract_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // 1. Variantes JSON
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        match &value {
            Value::Object(_) => {
                if let Some(token) = json_candidate(&value, 0) {
                    return Some(token);
                }
            }
            Value::String(inner) => return bare_string_token(inner),
            _ => {}
        }
    }

    // 2. Variantes XML / texto con marcadores
    if let Some(caps) = XML_TOKEN_RE.captures(trimmed) {
        let inner = caps.get(1)?.as_str().trim();
        if !inner.is_empty() {
            return Some(inner.to_string());
        }
    }

    // 3. String pelado
    bare_string_token(trimmed)
}

fn json_candidate(value: &Value, depth: u8) -> Option<String> {
    let map = value.as_object()?;
    for key in JSON_TOKEN_KEYS {
        for (k, v) in map {
            if !k.eq_ignore_ascii_case(key) {
                continue;
            }
            match v {
                Value::String(s) if !s.trim().is_empty() => return Some(s.trim().to_string()),
                // Algunas variantes anidan la carga útil ({"d":{"token":...}})
                Value::Object(_) if depth == 0 => {
                    if let Some(token) = json_candidate(v, 1) {
                        return Some(token);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

fn bare_string_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if UUID_RE.is_match(trimmed) {
        return Some(trimmed.to_string());
    }
    let first = trimmed.chars().next()?;
    if trimmed.len() >= 12 && !matches!(first, '[' | '{' | '<') {
        return Some(trimmed.to_string());
    }
    None
}

/// Token de sesión cacheado con su instante de adquisición
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

impl CachedToken {
    pub fn new(token: String, acquired_at: DateTime<Utc>) -> Self {
        Self { token, acquired_at }
    }

    /// Un token es fresco mientras le quede más que el margen de refresco.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let expires_at =
            self.acquired_at + Duration::seconds(TOKEN_TTL_SECS - TOKEN_REFRESH_MARGIN_SECS);
        now < expires_at
    }
}

/// Caché de token a nivel de proceso, inyectable para testeo.
///
/// La adquisición está serializada con un mutex single-flight: el primer
/// caller hace el fetch y los concurrentes esperan y reutilizan el
/// resultado re-chequeando el caché tras tomar el lock.
#[derive(Debug, Default)]
pub struct TokenCache {
    inner: RwLock<Option<CachedToken>>,
    /// Ver GpsBuddyClient::session_token: se toma antes de re-chequear el caché
    pub(crate) acquire_lock: Mutex<()>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devuelve el token cacheado si sigue fresco.
    pub async fn fresh_token(&self, now: DateTime<Utc>) -> Option<String> {
        let guard = self.inner.read().await;
        guard
            .as_ref()
            .filter(|t| t.is_fresh(now))
            .map(|t| t.token.clone())
    }

    pub async fn store(&self, token: String, now: DateTime<Utc>) {
        let mut guard = self.inner.write().await;
        *guard = Some(CachedToken::new(token, now));
    }

    /// Invalida el token cacheado (p. ej. tras un rechazo de autenticación).
    pub async fn invalidate(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_success_key() {
        assert_eq!(
            extract_token(r#"{"success":"abc-123"}"#).as_deref(),
            Some("abc-123")
        );
    }

    #[test]
    fn test_json_alternate_keys() {
        assert_eq!(
            extract_token(r#"{"SessionId":"tok-9876543210"}"#).as_deref(),
            Some("tok-9876543210")
        );
        assert_eq!(
            extract_token(r#"{"d":{"token":"nested-token-1"}}"#).as_deref(),
            Some("nested-token-1")
        );
    }

    #[test]
    fn test_xml_nested_token_tag() {
        assert_eq!(
            extract_token("<success><token>tok1</token></success>").as_deref(),
            Some("tok1")
        );
    }

    #[test]
    fn test_xml_string_tag() {
        assert_eq!(
            extract_token(r#"<string xmlns="http://tempuri.org/">tok-abc-def</string>"#).as_deref(),
            Some("tok-abc-def")
        );
    }

    #[test]
    fn test_bare_uuid_passthrough() {
        let uuid = "3fa85f64-5717-4562-b3fc-2c963f66afa6";
        assert_eq!(extract_token(uuid).as_deref(), Some(uuid));
    }

    #[test]
    fn test_opaque_id_heuristic() {
        assert_eq!(
            extract_token("A1B2C3D4E5F6G7").as_deref(),
            Some("A1B2C3D4E5F6G7")
        );
        // Demasiado corto
        assert_eq!(extract_token("short"), None);
        // Empieza con marcador de estructura
        assert_eq!(extract_token("<html>error de servidor</html>"), None);
    }

    #[test]
    fn test_quoted_json_string_uses_bare_heuristics() {
        assert_eq!(
            extract_token(r#""3fa85f64-5717-4562-b3fc-2c963f66afa6""#).as_deref(),
            Some("3fa85f64-5717-4562-b3fc-2c963f66afa6")
        );
    }

    #[test]
    fn test_json_without_candidates_falls_through() {
        assert_eq!(extract_token(r#"{"error":"bad credentials"}"#), None);
    }

    #[test]
    fn test_cached_token_ttl() {
        let now = Utc::now();
        let token = CachedToken::new("tok".to_string(), now);
        assert!(token.is_fresh(now));
        assert!(token.is_fresh(now + Duration::seconds(TOKEN_TTL_SECS - TOKEN_REFRESH_MARGIN_SECS - 1)));
        // Dentro del margen de refresco ya no se considera fresco
        assert!(!token.is_fresh(now + Duration::seconds(TOKEN_TTL_SECS - TOKEN_REFRESH_MARGIN_SECS)));
        assert!(!token.is_fresh(now + Duration::seconds(TOKEN_TTL_SECS)));
    }

    #[tokio::test]
    async fn test_token_cache_store_and_invalidate() {
        let cache = TokenCache::new();
        let now = Utc::now();
        assert_eq!(cache.fresh_token(now).await, None);

        cache.store("tok".to_string(), now).await;
        assert_eq!(cache.fresh_token(now).await.as_deref(), Some("tok"));

        cache.invalidate().await;
        assert_eq!(cache.fresh_token(now).await, None);
    }
}
