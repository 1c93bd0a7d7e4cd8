//! Modelos de telemetría vehicular
//!
//! Este módulo contiene el registro canónico `VehicleTelemetry` producido por
//! cada poll, las filas persistidas (último estado e historial) y la
//! normalización defensiva de las filas heterogéneas del upstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::utils::time::parse_flexible_timestamp;

/// Registro canónico de telemetría producido por cada poll.
///
/// `vehicle_id` es la identidad; todos los demás campos pueden faltar de
/// forma independiente. Las filas sin identidad se descartan en la
/// normalización.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleTelemetry {
    pub vehicle_id: i64,
    pub plate: Option<String>,
    pub driver_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Velocidad en km/h, redondeada a entero
    pub velocity: Option<i32>,
    pub address: Option<String>,
    pub location: Option<String>,
    /// Rumbo en grados
    pub direction: Option<f64>,
    /// Timestamp de la telemetría (distinto del instante de ingesta)
    pub time_indicator: Option<DateTime<Utc>>,
    /// Contadores acumulativos en segundos, monotónicos dentro del ciclo de servicio
    pub drive_time: Option<i64>,
    pub work_time: Option<i64>,
    pub idle_time: Option<i64>,
    pub stop_time: Option<i64>,
    pub total_distance: Option<f64>,
    pub start_km: Option<f64>,
    /// Bitfield opaco del upstream
    pub flags: Option<i64>,
    pub communication_ok: Option<bool>,
    pub color_code: Option<String>,
}

/// Último estado conocido por vehículo - mapea a la tabla vehicle_last_state
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VehicleLastState {
    pub vehicle_id: i64,
    pub plate: Option<String>,
    pub driver_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub velocity: Option<i32>,
    pub address: Option<String>,
    pub location: Option<String>,
    pub direction: Option<f64>,
    pub time_indicator: Option<DateTime<Utc>>,
    pub drive_time: Option<i64>,
    pub work_time: Option<i64>,
    pub idle_time: Option<i64>,
    pub stop_time: Option<i64>,
    pub total_distance: Option<f64>,
    pub start_km: Option<f64>,
    pub flags: Option<i64>,
    pub communication_ok: Option<bool>,
    pub color_code: Option<String>,
    /// Instante de ingesta, distinto del time_indicator de la telemetría
    pub updated_at: DateTime<Utc>,
}

/// Fila del historial append-only - mapea a la tabla vehicle_history
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VehicleHistoryRecord {
    pub id: i64,
    pub vehicle_id: i64,
    pub plate: Option<String>,
    pub driver_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub velocity: Option<i32>,
    pub address: Option<String>,
    pub location: Option<String>,
    pub direction: Option<f64>,
    pub time_indicator: Option<DateTime<Utc>>,
    pub drive_time: Option<i64>,
    pub work_time: Option<i64>,
    pub idle_time: Option<i64>,
    pub stop_time: Option<i64>,
    pub total_distance: Option<f64>,
    pub start_km: Option<f64>,
    pub flags: Option<i64>,
    pub communication_ok: Option<bool>,
    pub color_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Contadores acumulativos de un ciclo de servicio, en segundos.
/// Los campos ausentes en la telemetría se tratan como 0.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CumulativeCounters {
    pub drive_time: i64,
    pub work_time: i64,
    pub idle_time: i64,
    pub stop_time: i64,
}

impl CumulativeCounters {
    pub fn from_telemetry(v: &VehicleTelemetry) -> Self {
        Self {
            drive_time: v.drive_time.unwrap_or(0),
            work_time: v.work_time.unwrap_or(0),
            idle_time: v.idle_time.unwrap_or(0),
            stop_time: v.stop_time.unwrap_or(0),
        }
    }

    pub fn from_last_state(row: &VehicleLastState) -> Self {
        Self {
            drive_time: row.drive_time.unwrap_or(0),
            work_time: row.work_time.unwrap_or(0),
            idle_time: row.idle_time.unwrap_or(0),
            stop_time: row.stop_time.unwrap_or(0),
        }
    }
}

impl VehicleTelemetry {
    /// Normaliza una fila cruda del upstream al registro canónico.
    ///
    /// Devuelve `None` cuando la fila no trae una identidad de vehículo
    /// utilizable. Los campos numéricos no parseables quedan en `None`,
    /// nunca en 0.
    pub fn from_raw(row: &Value) -> Option<Self> {
        let vehicle_id = raw_i64(row, &["vehicleid", "vehicle_id", "id", "deviceid"])?;

        Some(Self {
            vehicle_id,
            plate: raw_str(row, &["plate", "licenseplate", "license_plate"])
                .map(|p| normalize_plate(&p)),
            driver_name: raw_str(row, &["drivername", "driver_name", "driver"]),
            latitude: raw_f64(row, &["latitude", "lat"]),
            longitude: raw_f64(row, &["longitude", "lon", "lng"]),
            velocity: raw_f64(row, &["velocity", "speed"]).map(|v| v.round() as i32),
            address: raw_str(row, &["address"]),
            location: raw_str(row, &["location", "place"]),
            direction: raw_f64(row, &["direction", "heading", "course"]),
            time_indicator: raw_str(row, &["timeindicator", "time_indicator", "gpstime", "devicetime", "time"])
                .and_then(|s| parse_flexible_timestamp(&s)),
            drive_time: raw_i64(row, &["drivetime", "drive_time"]),
            work_time: raw_i64(row, &["worktime", "work_time"]),
            idle_time: raw_i64(row, &["idletime", "idle_time"]),
            stop_time: raw_i64(row, &["stoptime", "stop_time"]),
            total_distance: raw_f64(row, &["totaldistance", "total_distance", "totalkm"]),
            start_km: raw_f64(row, &["startkm", "start_km"]),
            flags: raw_i64(row, &["flags", "flag"]),
            communication_ok: raw_bool(row, &["communicationok", "communication_ok", "commok"]),
            color_code: raw_str(row, &["colorcode", "color_code", "color"]),
        })
    }
}

/// Matrícula normalizada: mayúsculas y sin espacios internos.
pub fn normalize_plate(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Busca la primera clave candidata presente en la fila, ignorando mayúsculas.
fn raw_field<'a>(row: &'a Value, candidates: &[&str]) -> Option<&'a Value> {
    let map = row.as_object()?;
    for candidate in candidates {
        for (key, value) in map {
            if key.eq_ignore_ascii_case(candidate) && !value.is_null() {
                return Some(value);
            }
        }
    }
    None
}

fn raw_str(row: &Value, candidates: &[&str]) -> Option<String> {
    match raw_field(row, candidates)? {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn raw_f64(row: &Value, candidates: &[&str]) -> Option<f64> {
    match raw_field(row, candidates)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn raw_i64(row: &Value, candidates: &[&str]) -> Option<i64> {
    match raw_field(row, candidates)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        _ => None,
    }
}

fn raw_bool(row: &Value, candidates: &[&str]) -> Option<bool> {
    match raw_field(row, candidates)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_normalize_row_with_dotnet_timestamp() {
        let row = json!({
            "VehicleId": 42,
            "Plate": " 34 abc 123 ",
            "Velocity": "87.6",
            "time_indicator": "/Date(1700000000000)/",
            "DriveTime": "3600",
            "CommunicationOk": 1
        });

        let v = VehicleTelemetry::from_raw(&row).unwrap();
        assert_eq!(v.vehicle_id, 42);
        assert_eq!(v.plate.as_deref(), Some("34ABC123"));
        assert_eq!(v.velocity, Some(88));
        assert_eq!(
            v.time_indicator.unwrap(),
            Utc.timestamp_millis_opt(1700000000000).unwrap()
        );
        assert_eq!(v.drive_time, Some(3600));
        assert_eq!(v.communication_ok, Some(true));
    }

    #[test]
    fn test_row_without_vehicle_id_is_dropped() {
        let row = json!({ "plate": "34ABC123", "velocity": 90 });
        assert!(VehicleTelemetry::from_raw(&row).is_none());
    }

    #[test]
    fn test_non_numeric_fields_become_null_not_zero() {
        let row = json!({
            "vehicleid": 7,
            "velocity": "n/a",
            "latitude": "",
            "drivetime": "unknown"
        });

        let v = VehicleTelemetry::from_raw(&row).unwrap();
        assert_eq!(v.velocity, None);
        assert_eq!(v.latitude, None);
        assert_eq!(v.drive_time, None);
    }

    #[test]
    fn test_unparseable_timestamp_is_null() {
        let row = json!({ "vehicleid": 7, "gpstime": "hace un rato" });
        let v = VehicleTelemetry::from_raw(&row).unwrap();
        assert_eq!(v.time_indicator, None);
    }

    #[test]
    fn test_vehicle_id_accepts_numeric_string() {
        let row = json!({ "vehicleid": "105" });
        let v = VehicleTelemetry::from_raw(&row).unwrap();
        assert_eq!(v.vehicle_id, 105);
    }

    #[test]
    fn test_cumulative_counters_default_missing_to_zero() {
        let row = json!({ "vehicleid": 7, "drivetime": 120 });
        let v = VehicleTelemetry::from_raw(&row).unwrap();
        let counters = CumulativeCounters::from_telemetry(&v);
        assert_eq!(counters.drive_time, 120);
        assert_eq!(counters.work_time, 0);
        assert_eq!(counters.stop_time, 0);
    }
}
