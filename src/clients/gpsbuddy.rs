//! Cliente HTTP para GPSBuddy
//!
//! Este módulo contiene el cliente del API de rastreo vehicular: adquisición
//! del token de sesión, las dos estrategias de autenticación en orden,
//! reintentos con backoff lineal y el fallback multi-endpoint del fetch en
//! vivo. El resultado siempre es la lista canónica de `VehicleTelemetry`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio::time::sleep;

use crate::clients::token::{extract_token, TokenCache};
use crate::config::environment::EnvironmentConfig;
use crate::models::VehicleTelemetry;
use crate::utils::errors::{unexpected_response_error, AppError};

/// Intentos máximos por estrategia ante fallos transitorios
const MAX_ATTEMPTS: u64 = 3;
/// Paso del backoff lineal (250ms × número de intento)
const BACKOFF_STEP_MS: u64 = 250;

/// Funciones conocidas del fetch en vivo, probadas en orden después del
/// override configurado.
const LIVE_FUNCTION_FALLBACKS: &[&str] = &[
    "GetLiveInfo",
    "GetVehicleLiveInfo",
    "GetLiveData",
    "GetAllVehiclesLive",
];

/// Claves de nivel superior bajo las que el upstream devuelve el array de vehículos
const VEHICLE_ARRAY_KEYS: &[&str] = &["rows", "data", "vehicles", "result", "Table", "records", "d"];

lazy_static! {
    static ref AUTH_MARKER_RE: Regex =
        Regex::new(r"(?i)auth|login|unauthor|credential|session|token|password").unwrap();
}

/// Metadatos de un fetch exitoso
#[derive(Debug, Clone, Serialize)]
pub struct FetchMeta {
    pub function_name: String,
    pub fetched_at: DateTime<Utc>,
}

/// Resultado del fetch en vivo
#[derive(Debug)]
pub struct LiveFetchResult {
    pub vehicles: Vec<VehicleTelemetry>,
    pub meta: FetchMeta,
}

/// Fuente de telemetría consumida por el orquestador; abstraída para poder
/// testear el orquestador con stubs.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch_live_vehicles(&self) -> Result<LiveFetchResult>;
}

/// Cliente HTTP para el API de GPSBuddy
pub struct GpsBuddyClient {
    client: Client,
    config: EnvironmentConfig,
    token_cache: Arc<TokenCache>,
}

impl GpsBuddyClient {
    /// Crear nuevo cliente con el caché de token inyectado
    pub fn new(config: EnvironmentConfig, token_cache: Arc<TokenCache>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;

        Ok(Self {
            client,
            config,
            token_cache,
        })
    }

    /// Nombres de función a probar, en orden: el override configurado primero
    /// y después las alternativas conocidas.
    fn live_functions(&self) -> Vec<&str> {
        let mut functions: Vec<&str> = Vec::new();
        if let Some(override_fn) = self.config.gps_live_endpoint.as_deref() {
            functions.push(override_fn);
        }
        for &function in LIVE_FUNCTION_FALLBACKS {
            if !functions.contains(&function) {
                functions.push(function);
            }
        }
        functions
    }

    /// Llama a una función del upstream probando las estrategias en orden:
    /// credenciales directas primero, rutina XML con token después.
    async fn call_function(&self, function: &str) -> Result<Vec<Value>, AppError> {
        let strategies: [&dyn FetchStrategy; 2] = [&DirectCredentialStrategy, &TokenRoutineStrategy];
        let mut last_error: Option<AppError> = None;

        for strategy in strategies {
            match strategy.attempt(self, function).await {
                Ok(payload) => {
                    if let Some(message) = api_error_message(&payload) {
                        last_error = Some(AppError::ExternalApi(format!(
                            "{} devolvió error de API: {}",
                            function, message
                        )));
                        continue;
                    }
                    if let Some(rows) = extract_vehicle_array(&payload) {
                        return Ok(rows);
                    }
                    last_error = Some(unexpected_response_error(
                        &format!("{} via {} sin array de vehículos reconocible", function, strategy.name()),
                        &payload.to_string(),
                    ));
                }
                Err(AppError::AuthRejected(reason)) => {
                    log::warn!(
                        "🔐 {} rechazó autenticación en {}: {} — probando siguiente estrategia",
                        function,
                        strategy.name(),
                        reason
                    );
                    last_error = Some(AppError::AuthRejected(reason));
                }
                Err(e) => {
                    log::warn!("⚠️ {} falló en {}: {}", function, strategy.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AppError::Internal("sin estrategias configuradas".to_string())))
    }

    /// Obtiene el token de sesión, reutilizando el caché si sigue fresco.
    ///
    /// La adquisición es single-flight: los callers concurrentes esperan el
    /// mismo fetch en vuelo y re-chequean el caché tras tomar el lock.
    pub async fn session_token(&self) -> Result<String, AppError> {
        if let Some(token) = self.token_cache.fresh_token(Utc::now()).await {
            return Ok(token);
        }

        let _guard = self.token_cache.acquire_lock.lock().await;
        if let Some(token) = self.token_cache.fresh_token(Utc::now()).await {
            return Ok(token);
        }

        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.initialize_session().await {
                Ok(raw) => {
                    return match extract_token(&raw) {
                        Some(token) => {
                            log::info!("🔑 Token de sesión adquirido");
                            self.token_cache.store(token.clone(), Utc::now()).await;
                            Ok(token)
                        }
                        None => Err(unexpected_response_error(
                            "InitializeSession sin token reconocible",
                            &raw,
                        )),
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < MAX_ATTEMPTS {
                        sleep(Duration::from_millis(BACKOFF_STEP_MS * attempt)).await;
                    }
                }
            }
        }

        Err(AppError::ExternalApi(format!(
            "InitializeSession agotó {} intentos: {}",
            MAX_ATTEMPTS, last_error
        )))
    }

    async fn initialize_session(&self) -> Result<String, AppError> {
        let url = format!(
            "{}/Service/InitializeSession",
            self.config.gps_base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .query(&[
                ("login", self.config.gps_username.as_str()),
                ("password", self.config.gps_password.as_str()),
                ("isToken", "0"),
                ("timeout", "20"),
                ("returnType", "json"),
            ])
            .send()
            .await
            .map_err(|e| AppError::ExternalApi(format!("Error de red en InitializeSession: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalApi(format!(
                "InitializeSession HTTP {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::ExternalApi(format!("Error leyendo InitializeSession: {}", e)))
    }

    async fn direct_request(&self, function: &str) -> Result<String, AppError> {
        let url = format!(
            "{}/{}",
            self.config.gps_base_url.trim_end_matches('/'),
            function
        );

        let mut request = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(15))
            .query(&[
                ("login", self.config.gps_username.as_str()),
                ("password", self.config.gps_password.as_str()),
                ("companyid", self.config.gps_company_id.as_str()),
                ("returnType", "json"),
            ]);
        if let Some(group_id) = self.config.gps_group_id.as_deref() {
            request = request.query(&[("groupid", group_id)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::ExternalApi(format!("Error de red en {}: {}", function, e)))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalApi(format!(
                "{} HTTP {}",
                function,
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::ExternalApi(format!("Error leyendo {}: {}", function, e)))
    }

    async fn execute_request(&self, url: &str) -> Result<String, AppError> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(20))
            .send()
            .await
            .map_err(|e| AppError::ExternalApi(format!("Error de red en ExecuteReturnSet: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalApi(format!(
                "ExecuteReturnSet HTTP {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::ExternalApi(format!("Error leyendo ExecuteReturnSet: {}", e)))
    }

    /// Argumentos de la rutina del fetch en vivo
    fn routine_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("companyid", self.config.gps_company_id.clone())];
        if let Some(group_id) = &self.config.gps_group_id {
            params.push(("groupid", group_id.clone()));
        }
        params
    }
}

#[async_trait]
impl TelemetrySource for GpsBuddyClient {
    /// Fetch en vivo con fallback multi-endpoint: prueba cada nombre de
    /// función en orden y se queda con el primero que responde con un array
    /// de vehículos. Falla solo cuando se agotaron todas las combinaciones.
    async fn fetch_live_vehicles(&self) -> Result<LiveFetchResult> {
        let functions = self.live_functions();
        let mut failures: Vec<String> = Vec::new();
        let mut last_error: Option<AppError> = None;

        for function in &functions {
            match self.call_function(function).await {
                Ok(rows) => {
                    let vehicles: Vec<VehicleTelemetry> =
                        rows.iter().filter_map(VehicleTelemetry::from_raw).collect();
                    log::info!(
                        "🛰️ {}: {} filas crudas, {} vehículos normalizados",
                        function,
                        rows.len(),
                        vehicles.len()
                    );
                    return Ok(LiveFetchResult {
                        vehicles,
                        meta: FetchMeta {
                            function_name: (*function).to_string(),
                            fetched_at: Utc::now(),
                        },
                    });
                }
                Err(e) => {
                    failures.push(format!("{}: {}", function, e));
                    last_error = Some(e);
                }
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "sin funciones configuradas".to_string());
        Err(anyhow!(
            "Fetch en vivo agotado tras probar [{}]; último error: {}",
            functions.join(", "),
            last
        ))
        .with_context_failures(failures)
    }
}

/// Extiende el error final con cada fallo intermedio registrado.
trait WithContextFailures<T> {
    fn with_context_failures(self, failures: Vec<String>) -> Result<T>;
}

impl<T> WithContextFailures<T> for Result<T> {
    fn with_context_failures(self, failures: Vec<String>) -> Result<T> {
        self.map_err(|e| {
            if failures.is_empty() {
                e
            } else {
                anyhow!("{}\nintentos: {}", e, failures.join(" | "))
            }
        })
    }
}

/// Estrategia de fetch contra el upstream. Las estrategias se iteran en
/// orden con corte en el primer éxito; `AuthRejected` señala el salto a la
/// siguiente sin agotar el presupuesto de reintentos.
#[async_trait]
trait FetchStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn attempt(&self, ctx: &GpsBuddyClient, function: &str) -> Result<Value, AppError>;
}

/// Estrategia primaria: GET directo con credenciales, sin token.
struct DirectCredentialStrategy;

#[async_trait]
impl FetchStrategy for DirectCredentialStrategy {
    fn name(&self) -> &'static str {
        "credenciales directas"
    }

    async fn attempt(&self, ctx: &GpsBuddyClient, function: &str) -> Result<Value, AppError> {
        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match ctx.direct_request(function).await {
                Ok(raw) => {
                    let payload = parse_payload(function, &raw)?;
                    if let Some(reason) = auth_rejection(&payload) {
                        // No es fallo de red: no consume el presupuesto de reintentos
                        return Err(AppError::AuthRejected(reason));
                    }
                    return Ok(payload);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < MAX_ATTEMPTS {
                        sleep(Duration::from_millis(BACKOFF_STEP_MS * attempt)).await;
                    }
                }
            }
        }
        Err(AppError::ExternalApi(format!(
            "{} agotó {} intentos: {}",
            self.name(),
            MAX_ATTEMPTS,
            last_error
        )))
    }
}

/// Estrategia de fallback: token de sesión + rutina XML via ExecuteReturnSet.
struct TokenRoutineStrategy;

#[async_trait]
impl FetchStrategy for TokenRoutineStrategy {
    fn name(&self) -> &'static str {
        "rutina con token"
    }

    async fn attempt(&self, ctx: &GpsBuddyClient, function: &str) -> Result<Value, AppError> {
        let token = ctx.session_token().await?;
        let routine = build_routine_payload(function, &ctx.routine_params());
        let url = format!(
            "{}/Service/ExecuteReturnSet?value={}&token={}",
            ctx.config.gps_base_url.trim_end_matches('/'),
            urlencoding::encode(&routine),
            urlencoding::encode(&token)
        );

        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match ctx.execute_request(&url).await {
                Ok(raw) => {
                    let payload = parse_payload(function, &raw)?;
                    if let Some(reason) = auth_rejection(&payload) {
                        // Token posiblemente vencido en el servidor: se invalida
                        // para que el próximo poll re-adquiera
                        ctx.token_cache.invalidate().await;
                        return Err(AppError::AuthRejected(reason));
                    }
                    return Ok(payload);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < MAX_ATTEMPTS {
                        sleep(Duration::from_millis(BACKOFF_STEP_MS * attempt)).await;
                    }
                }
            }
        }
        Err(AppError::ExternalApi(format!(
            "{} agotó {} intentos: {}",
            self.name(),
            MAX_ATTEMPTS,
            last_error
        )))
    }
}

/// Serializa la llamada como payload de rutina XML:
/// nombre de función + mapa de argumentos como tags anidados.
fn build_routine_payload(function: &str, params: &[(&str, String)]) -> String {
    let mut xml = String::new();
    xml.push_str("<routine>");
    xml.push_str(&format!("<name>{}</name>", escape_xml(function)));
    for (name, value) in params {
        xml.push_str(&format!(
            "<param><name>{}</name><value>{}</value></param>",
            escape_xml(name),
            escape_xml(value)
        ));
    }
    xml.push_str("</routine>");
    xml
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn parse_payload(function: &str, raw: &str) -> Result<Value, AppError> {
    serde_json::from_str(raw)
        .map_err(|_| unexpected_response_error(&format!("{} devolvió un payload no-JSON", function), raw))
}

/// Mensaje de error a nivel API, si el payload trae un objeto de error explícito.
fn api_error_message(payload: &Value) -> Option<String> {
    let map = payload.as_object()?;
    for (key, value) in map {
        let lowered = key.to_ascii_lowercase();
        if lowered != "error" && lowered != "errormessage" && lowered != "errmsg" && lowered != "errorcode" {
            continue;
        }
        // "error": false / null / 0 significa ausencia de error
        match value {
            Value::Null | Value::Bool(false) => continue,
            Value::Number(n) if n.as_i64() == Some(0) => continue,
            Value::String(s) if s.trim().is_empty() => continue,
            Value::String(s) => return Some(s.clone()),
            other => return Some(other.to_string()),
        }
    }
    None
}

/// Marcador explícito de rechazo de autenticación en la respuesta.
fn auth_rejection(payload: &Value) -> Option<String> {
    api_error_message(payload).filter(|msg| AUTH_MARKER_RE.is_match(msg))
}

/// Localiza el array de vehículos bajo las claves de nivel superior conocidas.
fn extract_vehicle_array(payload: &Value) -> Option<Vec<Value>> {
    match payload {
        Value::Array(rows) => Some(rows.clone()),
        Value::Object(map) => {
            for key in VEHICLE_ARRAY_KEYS {
                for (k, v) in map {
                    if !k.eq_ignore_ascii_case(key) {
                        continue;
                    }
                    match v {
                        Value::Array(rows) => return Some(rows.clone()),
                        // Algunas variantes anidan la carga útil ({"d":{"rows":[...]}})
                        Value::Object(_) => {
                            if let Some(rows) = extract_vehicle_array(v) {
                                return Some(rows);
                            }
                        }
                        _ => {}
                    }
                }
            }
            None
        }
        _ => None,
    }
}
