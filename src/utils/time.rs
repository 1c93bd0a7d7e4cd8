//! Utilidades de tiempo
//!
//! Este módulo maneja el timestamp propietario del upstream (`/Date(<millis>)/`),
//! la aritmética de día local y el formato de duraciones para los reportes.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

/// Offset horario local de la flota (UTC+3). El corte de día de los
/// contadores diarios se calcula contra este offset, no contra UTC.
pub const LOCAL_UTC_OFFSET_HOURS: i32 = 3;

lazy_static! {
    static ref DOTNET_DATE_RE: Regex = Regex::new(r"/Date\((-?\d+)(?:[+-]\d{4})?\)/").unwrap();
}

/// Formatos de fecha genéricos que el upstream ha llegado a devolver
/// cuando no usa la codificación `/Date(<millis>)/`.
const FALLBACK_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

/// Convierte la codificación propietaria `/Date(<millis>)/` a un instante UTC.
pub fn parse_dotnet_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let caps = DOTNET_DATE_RE.captures(raw)?;
    let millis: i64 = caps.get(1)?.as_str().parse().ok()?;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// Parseo defensivo de timestamps: primero la codificación propietaria,
/// después RFC 3339 y los formatos genéricos conocidos. `None` si nada aplica.
pub fn parse_flexible_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(ts) = parse_dotnet_timestamp(trimmed) {
        return Some(ts);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in FALLBACK_DATE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            // Sin zona explícita se asume hora local de la flota
            return Some(from_local_naive(naive));
        }
    }
    None
}

/// Instante UTC del inicio del día local (UTC+3) que contiene a `now`.
pub fn local_day_start(now: DateTime<Utc>, offset_hours: i32) -> DateTime<Utc> {
    let offset = FixedOffset::east_opt(offset_hours * 3600).unwrap();
    let local_day = now.with_timezone(&offset).date_naive();
    let midnight = local_day.and_hms_opt(0, 0, 0).unwrap();
    offset
        .from_local_datetime(&midnight)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

/// Etiqueta de hora local (UTC+3) para los textos de alerta.
pub fn local_time_label(instant: DateTime<Utc>) -> String {
    let offset = FixedOffset::east_opt(LOCAL_UTC_OFFSET_HOURS * 3600).unwrap();
    instant.with_timezone(&offset).format("%H:%M").to_string()
}

/// Formatea segundos como `"2h 13m"`; el componente de horas se omite cuando es 0.
pub fn format_duration_hm(total_secs: i64) -> String {
    let secs = total_secs.max(0);
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours == 0 {
        format!("{}m", minutes)
    } else {
        format!("{}h {}m", hours, minutes)
    }
}

fn from_local_naive(naive: NaiveDateTime) -> DateTime<Utc> {
    let offset = FixedOffset::east_opt(LOCAL_UTC_OFFSET_HOURS * 3600).unwrap();
    offset
        .from_local_datetime(&naive)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_dotnet_timestamp_to_utc_instant() {
        let ts = parse_dotnet_timestamp("/Date(1700000000000)/").unwrap();
        assert_eq!(ts, Utc.timestamp_millis_opt(1700000000000).unwrap());
    }

    #[test]
    fn test_dotnet_timestamp_with_zone_suffix() {
        let ts = parse_dotnet_timestamp("/Date(1700000000000+0300)/").unwrap();
        assert_eq!(ts, Utc.timestamp_millis_opt(1700000000000).unwrap());
    }

    #[test]
    fn test_flexible_timestamp_rfc3339() {
        let ts = parse_flexible_timestamp("2024-05-01T10:30:00Z").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_flexible_timestamp_unparseable_is_none() {
        assert!(parse_flexible_timestamp("no es una fecha").is_none());
        assert!(parse_flexible_timestamp("").is_none());
    }

    #[test]
    fn test_local_day_start_shifts_by_offset() {
        // 01:30 UTC = 04:30 local (UTC+3) → el día local empezó a las 21:00 UTC del día anterior
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 1, 30, 0).unwrap();
        let start = local_day_start(now, LOCAL_UTC_OFFSET_HOURS);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 1, 21, 0, 0).unwrap());
    }

    #[test]
    fn test_local_day_start_before_local_midnight() {
        // 22:30 UTC = 01:30 local del día siguiente
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 22, 30, 0).unwrap();
        let start = local_day_start(now, LOCAL_UTC_OFFSET_HOURS);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 1, 21, 0, 0).unwrap());
    }

    #[test]
    fn test_format_duration_omits_zero_hours() {
        assert_eq!(format_duration_hm(780), "13m");
        assert_eq!(format_duration_hm(7980), "2h 13m");
        assert_eq!(format_duration_hm(0), "0m");
        assert_eq!(format_duration_hm(-5), "0m");
    }
}
