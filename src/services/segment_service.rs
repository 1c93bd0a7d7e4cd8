//! Segmentación de manejo y parada
//!
//! Este módulo clasifica las muestras del historial en tramos contiguos de
//! Drive/Stop (run-length encoding), estima la distancia de cada tramo con
//! Haversine por factor de desvío vial y arma el resumen del rango.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::VehicleHistoryRecord;
use crate::repositories::{HistoryQuery, TelemetryRepository};
use crate::utils::errors::AppError;
use crate::utils::time::format_duration_hm;

/// Velocidad mínima en km/h para clasificar una muestra como Drive
const DRIVE_MIN_VELOCITY: i32 = 1;

/// Factor fijo de desvío vial aplicado a la distancia de círculo máximo
pub const ROAD_DETOUR_FACTOR: f64 = 1.2;

/// Piso de ruido: distancias menores se reportan como 0
const NOISE_FLOOR_KM: f64 = 0.1;

/// Radio terrestre medio en km
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Clasificación de un tramo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SegmentKind {
    Drive,
    Stop,
}

/// Tramo contiguo de muestras con la misma clasificación
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub start_location: Option<String>,
    pub end_location: Option<String>,
    pub start_latitude: Option<f64>,
    pub start_longitude: Option<f64>,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
    pub start_total_distance: Option<f64>,
    pub end_total_distance: Option<f64>,
    /// Duración en segundos enteros, recortada a ≥ 0
    pub duration_secs: i64,
    /// Duración formateada "Hh Mm" (sin componente de horas cuando es 0)
    pub duration_label: String,
    /// Distancia estimada en km, redondeada a 0.1
    pub distance_km: f64,
}

/// Resumen del rango segmentado
#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentSummary {
    pub drive_secs: i64,
    pub drive_label: String,
    pub drive_distance_km: f64,
    pub stop_secs: i64,
    pub stop_label: String,
}

/// Reporte completo de segmentación
#[derive(Debug, Clone, Serialize)]
pub struct SegmentReport {
    pub segments: Vec<Segment>,
    pub summary: SegmentSummary,
}

/// Distancia de círculo máximo entre dos coordenadas, en km.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Segmenta filas de historial ya ordenadas ascendente por tiempo.
///
/// Historial vacío produce un reporte vacío con resumen en cero, no un error.
pub fn build_segments(rows: &[VehicleHistoryRecord]) -> SegmentReport {
    // Solo segmentan las muestras con timestamp de telemetría
    let samples: Vec<&VehicleHistoryRecord> = rows
        .iter()
        .filter(|row| row.time_indicator.is_some())
        .collect();

    let mut segments: Vec<Segment> = Vec::new();
    let mut run_start = 0usize;

    for i in 0..samples.len() {
        let is_last = i + 1 == samples.len();
        let next_differs = !is_last && classify(samples[i + 1]) != classify(samples[i]);
        if is_last || next_differs {
            // El tramo se extiende hasta la muestra de transición: el fin de
            // un tramo es el inicio del siguiente, así las duraciones suman
            // el tiempo total transcurrido del rango
            let end_idx = if is_last { i } else { i + 1 };
            segments.push(make_segment(
                samples[run_start],
                samples[end_idx],
                classify(samples[run_start]),
            ));
            run_start = i + 1;
        }
    }

    let summary = summarize(&segments);
    SegmentReport { segments, summary }
}

/// Camino de lectura: carga el rango ascendente del historial y lo segmenta.
pub async fn segment_history(
    repository: &TelemetryRepository,
    vehicle_id: i64,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> Result<SegmentReport, AppError> {
    let rows = repository
        .get_history(
            vehicle_id,
            &HistoryQuery {
                since,
                until,
                limit: None,
            },
        )
        .await?;
    Ok(build_segments(&rows))
}

fn classify(row: &VehicleHistoryRecord) -> SegmentKind {
    if row.velocity.unwrap_or(0) >= DRIVE_MIN_VELOCITY {
        SegmentKind::Drive
    } else {
        SegmentKind::Stop
    }
}

fn make_segment(
    start: &VehicleHistoryRecord,
    end: &VehicleHistoryRecord,
    kind: SegmentKind,
) -> Segment {
    let start_time = start.time_indicator.unwrap();
    let end_time = end.time_indicator.unwrap();
    let duration_secs = (end_time - start_time).num_seconds().max(0);

    Segment {
        kind,
        start_time,
        end_time,
        start_location: start.location.clone(),
        end_location: end.location.clone(),
        start_latitude: start.latitude,
        start_longitude: start.longitude,
        end_latitude: end.latitude,
        end_longitude: end.longitude,
        start_total_distance: start.total_distance,
        end_total_distance: end.total_distance,
        duration_secs,
        duration_label: format_duration_hm(duration_secs),
        distance_km: segment_distance_km(start, end),
    }
}

/// Distancia estimada del tramo: Haversine entre extremos por el factor de
/// desvío, redondeada a 0.1 km. Coordenadas faltantes o en cero anulan la
/// estimación; por debajo del piso de ruido se reporta 0.
fn segment_distance_km(start: &VehicleHistoryRecord, end: &VehicleHistoryRecord) -> f64 {
    let coords = [
        start.latitude,
        start.longitude,
        end.latitude,
        end.longitude,
    ];
    if coords.iter().any(|c| c.map(|v| v == 0.0).unwrap_or(true)) {
        return 0.0;
    }

    let raw = haversine_km(
        start.latitude.unwrap(),
        start.longitude.unwrap(),
        end.latitude.unwrap(),
        end.longitude.unwrap(),
    ) * ROAD_DETOUR_FACTOR;

    // El piso se aplica antes del redondeo: 60 m redondearían a 0.1 km y
    // colarían ruido de GPS como distancia recorrida
    if raw < NOISE_FLOOR_KM {
        0.0
    } else {
        (raw * 10.0).round() / 10.0
    }
}

fn summarize(segments: &[Segment]) -> SegmentSummary {
    let mut summary = SegmentSummary::default();
    for segment in segments {
        match segment.kind {
            SegmentKind::Drive => {
                summary.drive_secs += segment.duration_secs;
                summary.drive_distance_km += segment.distance_km;
            }
            SegmentKind::Stop => {
                summary.stop_secs += segment.duration_secs;
            }
        }
    }
    // Redondeo final para no acumular residuos binarios
    summary.drive_distance_km = (summary.drive_distance_km * 10.0).round() / 10.0;
    summary.drive_label = format_duration_hm(summary.drive_secs);
    summary.stop_label = format_duration_hm(summary.stop_secs);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(minute: u32, velocity: i32, lat: f64, lon: f64) -> VehicleHistoryRecord {
        VehicleHistoryRecord {
            id: minute as i64,
            vehicle_id: 1,
            plate: Some("34ABC123".to_string()),
            driver_name: None,
            latitude: Some(lat),
            longitude: Some(lon),
            velocity: Some(velocity),
            address: None,
            location: Some(format!("punto-{}", minute)),
            direction: None,
            time_indicator: Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap()),
            drive_time: None,
            work_time: None,
            idle_time: None,
            stop_time: None,
            total_distance: None,
            start_km: None,
            flags: None,
            communication_ok: None,
            color_code: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_run_length_segments_stop_drive_stop() {
        // [0, 0, 10, 10, 0] a un minuto de separación → Stop, Drive, Stop
        let rows = vec![
            sample(0, 0, 41.0, 29.0),
            sample(1, 0, 41.0, 29.0),
            sample(2, 10, 41.01, 29.01),
            sample(3, 10, 41.02, 29.02),
            sample(4, 0, 41.02, 29.02),
        ];

        let report = build_segments(&rows);
        let kinds: Vec<SegmentKind> = report.segments.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SegmentKind::Stop, SegmentKind::Drive, SegmentKind::Stop]);

        // Cada tramo se extiende hasta la muestra de transición: las
        // duraciones suman el total transcurrido del rango (4 minutos)
        let total: i64 = report.segments.iter().map(|s| s.duration_secs).sum();
        assert_eq!(total, 240);
        assert_eq!(report.segments[0].duration_secs, 120);
        assert_eq!(report.segments[1].duration_secs, 120);
        assert_eq!(report.segments[2].duration_secs, 0);

        // El fin de un tramo coincide con el inicio del siguiente
        assert_eq!(report.segments[0].end_time, report.segments[1].start_time);
    }

    #[test]
    fn test_empty_history_yields_empty_report() {
        let report = build_segments(&[]);
        assert!(report.segments.is_empty());
        assert_eq!(report.summary.drive_secs, 0);
        assert_eq!(report.summary.stop_secs, 0);
        assert_eq!(report.summary.drive_distance_km, 0.0);
    }

    #[test]
    fn test_haversine_known_distance() {
        // Estambul (41.0082, 28.9784) → Ankara (39.9334, 32.8597) ≈ 350 km
        let d = haversine_km(41.0082, 28.9784, 39.9334, 32.8597);
        assert!((d - 350.0).abs() < 5.0, "distancia inesperada: {}", d);
    }

    #[test]
    fn test_segment_distance_applies_detour_and_rounding() {
        let rows = vec![
            sample(0, 10, 41.0082, 28.9784),
            sample(30, 10, 39.9334, 32.8597),
        ];
        let report = build_segments(&rows);
        assert_eq!(report.segments.len(), 1);
        let expected = (haversine_km(41.0082, 28.9784, 39.9334, 32.8597) * ROAD_DETOUR_FACTOR * 10.0).round() / 10.0;
        assert_eq!(report.segments[0].distance_km, expected);
        assert_eq!(report.summary.drive_distance_km, expected);
    }

    #[test]
    fn test_zero_or_missing_coordinates_skip_distance() {
        let mut a = sample(0, 10, 0.0, 29.0);
        let b = sample(1, 10, 41.0, 29.0);
        let report = build_segments(&[a.clone(), b.clone()]);
        assert_eq!(report.segments[0].distance_km, 0.0);

        a.latitude = None;
        let report = build_segments(&[a, b]);
        assert_eq!(report.segments[0].distance_km, 0.0);
    }

    #[test]
    fn test_noise_floor_zeroes_tiny_distances() {
        // ~55 m en línea recta: bajo el piso de 0.1 km
        let rows = vec![
            sample(0, 5, 41.00000, 29.00000),
            sample(1, 5, 41.00050, 29.00000),
        ];
        let report = build_segments(&rows);
        assert_eq!(report.segments[0].distance_km, 0.0);
    }

    #[test]
    fn test_null_velocity_classifies_as_stop() {
        let mut row = sample(0, 0, 41.0, 29.0);
        row.velocity = None;
        let report = build_segments(&[row, sample(1, 0, 41.0, 29.0)]);
        assert_eq!(report.segments.len(), 1);
        assert_eq!(report.segments[0].kind, SegmentKind::Stop);
    }

    #[test]
    fn test_duration_labels() {
        let rows = vec![sample(0, 10, 41.0, 29.0), sample(13, 10, 41.1, 29.1)];
        let report = build_segments(&rows);
        assert_eq!(report.segments[0].duration_label, "13m");
        assert_eq!(report.summary.drive_label, "13m");
    }

    #[test]
    fn test_rows_without_timestamp_are_skipped() {
        let mut row = sample(0, 10, 41.0, 29.0);
        row.time_indicator = None;
        let report = build_segments(&[row]);
        assert!(report.segments.is_empty());
    }
}
