//! Configuración de variables de entorno
//!
//! Este módulo maneja la configuración del pipeline. Las credenciales del
//! upstream son precondición dura: si faltan claves requeridas la carga
//! falla con la lista completa enumerada, nunca con un no-op silencioso.

use std::env;

use crate::utils::errors::{configuration_error, AppError};

/// Configuración del entorno
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub environment: String,
    // Upstream GPSBuddy
    pub gps_base_url: String,
    pub gps_company_id: String,
    pub gps_username: String,
    pub gps_password: String,
    pub gps_group_id: Option<String>,
    /// Override del nombre de función del fetch en vivo; si falta se usa la
    /// lista de funciones conocidas en orden.
    pub gps_live_endpoint: Option<String>,
    // Retención y señales derivadas
    pub history_retention_days: i64,
    pub speed_limit_kmh: i32,
    pub speed_alert_cooldown_secs: i64,
    pub speed_window_secs: i64,
    // Cadencias de los dos triggers periódicos
    pub refresh_interval_secs: u64,
    pub speed_check_interval_secs: u64,
}

impl EnvironmentConfig {
    /// Carga la configuración desde el entorno.
    ///
    /// Las claves requeridas faltantes se acumulan y se reportan todas
    /// juntas en un único error de configuración.
    pub fn from_env() -> Result<Self, AppError> {
        let mut missing: Vec<&str> = Vec::new();

        let gps_base_url = require(&mut missing, "GPS_BASE_URL");
        let gps_company_id = require(&mut missing, "GPS_COMPANY_ID");
        let gps_username = require(&mut missing, "GPS_USERNAME");
        let gps_password = require(&mut missing, "GPS_PASSWORD");

        if !missing.is_empty() {
            return Err(configuration_error(&missing));
        }

        Ok(Self {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            gps_base_url: gps_base_url.unwrap_or_default(),
            gps_company_id: gps_company_id.unwrap_or_default(),
            gps_username: gps_username.unwrap_or_default(),
            gps_password: gps_password.unwrap_or_default(),
            gps_group_id: env::var("GPS_GROUP_ID").ok().filter(|v| !v.is_empty()),
            gps_live_endpoint: env::var("GPS_LIVE_ENDPOINT").ok().filter(|v| !v.is_empty()),
            history_retention_days: parse_env("HISTORY_RETENTION_DAYS", 30),
            speed_limit_kmh: parse_env("SPEED_LIMIT_KMH", 94),
            speed_alert_cooldown_secs: parse_env("SPEED_ALERT_COOLDOWN_SECS", 300),
            speed_window_secs: parse_env("SPEED_WINDOW_SECS", 300),
            refresh_interval_secs: parse_env("REFRESH_INTERVAL_SECS", 300),
            speed_check_interval_secs: parse_env("SPEED_CHECK_INTERVAL_SECS", 30),
        })
    }

    /// Verificar si estamos en modo desarrollo
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Verificar si estamos en modo producción
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn require(missing: &mut Vec<&'static str>, key: &'static str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => {
            missing.push(key);
            None
        }
    }
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Las variables de entorno son estado de proceso: un único test
    // secuencial cubre ambos caminos para evitar carreras entre tests.
    #[test]
    fn test_from_env_missing_and_complete() {
        for key in ["GPS_BASE_URL", "GPS_COMPANY_ID", "GPS_USERNAME", "GPS_PASSWORD"] {
            env::remove_var(key);
        }

        let err = EnvironmentConfig::from_env().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("GPS_BASE_URL"));
        assert!(message.contains("GPS_COMPANY_ID"));
        assert!(message.contains("GPS_USERNAME"));
        assert!(message.contains("GPS_PASSWORD"));

        env::set_var("GPS_BASE_URL", "https://tracking.example.com");
        env::set_var("GPS_COMPANY_ID", "1001");
        env::set_var("GPS_USERNAME", "fleet");
        env::set_var("GPS_PASSWORD", "secret");

        let config = EnvironmentConfig::from_env().unwrap();
        assert_eq!(config.gps_base_url, "https://tracking.example.com");
        assert_eq!(config.history_retention_days, 30);
        assert_eq!(config.speed_limit_kmh, 94);
        assert_eq!(config.speed_alert_cooldown_secs, 300);
    }
}
