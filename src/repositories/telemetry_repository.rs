//! Repositorio de telemetría
//!
//! Este módulo mantiene el último estado conocido por vehículo (upsert) y el
//! historial append-only (insert-if-new), con las consultas de rango y la
//! poda por retención. El batch de cada poll se escribe en una única
//! transacción: último estado e historial nunca divergen por fallo parcial.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::models::{CumulativeCounters, VehicleHistoryRecord, VehicleLastState, VehicleTelemetry};
use crate::utils::errors::AppError;
use crate::utils::time::{local_day_start, LOCAL_UTC_OFFSET_HOURS};

/// Tope duro de filas por página
pub const MAX_PAGE_SIZE: i64 = 50;

/// Límite por defecto del query de historial sin rango
pub const DEFAULT_HISTORY_LIMIT: i64 = 500;

/// Conteos de un batch persistido
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UpsertCounts {
    pub updated: u64,
    pub history_inserted: u64,
}

/// Filtros del query de historial
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Filtros del query paginado de historial
#[derive(Debug, Clone)]
pub struct HistoryPageQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub page: i64,
    pub page_size: i64,
}

/// Página de historial con el total para el paginador
#[derive(Debug, Serialize)]
pub struct HistoryPage {
    pub rows: Vec<VehicleHistoryRecord>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, FromRow)]
struct TodayStartRow {
    vehicle_id: i64,
    drive_time: Option<i64>,
    work_time: Option<i64>,
    idle_time: Option<i64>,
    stop_time: Option<i64>,
}

const UPSERT_LAST_SQL: &str = r#"
INSERT INTO vehicle_last_state (
    vehicle_id, plate, driver_name, latitude, longitude, velocity,
    address, location, direction, time_indicator,
    drive_time, work_time, idle_time, stop_time,
    total_distance, start_km, flags, communication_ok, color_code, updated_at
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
)
ON CONFLICT (vehicle_id) DO UPDATE SET
    plate = EXCLUDED.plate,
    driver_name = EXCLUDED.driver_name,
    latitude = EXCLUDED.latitude,
    longitude = EXCLUDED.longitude,
    velocity = EXCLUDED.velocity,
    address = EXCLUDED.address,
    location = EXCLUDED.location,
    direction = EXCLUDED.direction,
    time_indicator = EXCLUDED.time_indicator,
    drive_time = EXCLUDED.drive_time,
    work_time = EXCLUDED.work_time,
    idle_time = EXCLUDED.idle_time,
    stop_time = EXCLUDED.stop_time,
    total_distance = EXCLUDED.total_distance,
    start_km = EXCLUDED.start_km,
    flags = EXCLUDED.flags,
    communication_ok = EXCLUDED.communication_ok,
    color_code = EXCLUDED.color_code,
    updated_at = EXCLUDED.updated_at
"#;

const INSERT_HISTORY_SQL: &str = r#"
INSERT INTO vehicle_history (
    vehicle_id, plate, driver_name, latitude, longitude, velocity,
    address, location, direction, time_indicator,
    drive_time, work_time, idle_time, stop_time,
    total_distance, start_km, flags, communication_ok, color_code, created_at
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
)
ON CONFLICT (vehicle_id, time_indicator) DO NOTHING
"#;

pub struct TelemetryRepository {
    pool: PgPool,
}

impl TelemetryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persiste un batch completo de un poll: upsert del último estado y,
    /// cuando la fila trae `time_indicator`, insert idempotente al historial.
    /// Todo o nada: una única transacción para el batch entero.
    pub async fn upsert_last_and_history(
        &self,
        vehicles: &[VehicleTelemetry],
    ) -> Result<UpsertCounts, AppError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut counts = UpsertCounts::default();

        for vehicle in vehicles {
            Self::upsert_last(&mut tx, vehicle, now).await?;
            counts.updated += 1;

            if vehicle.time_indicator.is_some() {
                counts.history_inserted += Self::insert_history(&mut tx, vehicle, now).await?;
            }
        }

        tx.commit().await?;
        Ok(counts)
    }

    async fn upsert_last(
        tx: &mut Transaction<'_, Postgres>,
        vehicle: &VehicleTelemetry,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(UPSERT_LAST_SQL)
            .bind(vehicle.vehicle_id)
            .bind(&vehicle.plate)
            .bind(&vehicle.driver_name)
            .bind(vehicle.latitude)
            .bind(vehicle.longitude)
            .bind(vehicle.velocity)
            .bind(&vehicle.address)
            .bind(&vehicle.location)
            .bind(vehicle.direction)
            .bind(vehicle.time_indicator)
            .bind(vehicle.drive_time)
            .bind(vehicle.work_time)
            .bind(vehicle.idle_time)
            .bind(vehicle.stop_time)
            .bind(vehicle.total_distance)
            .bind(vehicle.start_km)
            .bind(vehicle.flags)
            .bind(vehicle.communication_ok)
            .bind(&vehicle.color_code)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_history(
        tx: &mut Transaction<'_, Postgres>,
        vehicle: &VehicleTelemetry,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(INSERT_HISTORY_SQL)
            .bind(vehicle.vehicle_id)
            .bind(&vehicle.plate)
            .bind(&vehicle.driver_name)
            .bind(vehicle.latitude)
            .bind(vehicle.longitude)
            .bind(vehicle.velocity)
            .bind(&vehicle.address)
            .bind(&vehicle.location)
            .bind(vehicle.direction)
            .bind(vehicle.time_indicator)
            .bind(vehicle.drive_time)
            .bind(vehicle.work_time)
            .bind(vehicle.idle_time)
            .bind(vehicle.stop_time)
            .bind(vehicle.total_distance)
            .bind(vehicle.start_km)
            .bind(vehicle.flags)
            .bind(vehicle.communication_ok)
            .bind(&vehicle.color_code)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    /// Último estado de toda la flota, ordenado por matrícula sin distinguir
    /// mayúsculas.
    pub async fn get_last_all(&self) -> Result<Vec<VehicleLastState>, AppError> {
        let rows = sqlx::query_as::<_, VehicleLastState>(
            "SELECT * FROM vehicle_last_state ORDER BY LOWER(plate) ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Último estado de un vehículo puntual.
    pub async fn get_last_by_vehicle_id(
        &self,
        vehicle_id: i64,
    ) -> Result<Option<VehicleLastState>, AppError> {
        let row = sqlx::query_as::<_, VehicleLastState>(
            "SELECT * FROM vehicle_last_state WHERE vehicle_id = $1",
        )
        .bind(vehicle_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Historial de un vehículo en orden cronológico ascendente.
    ///
    /// Sin rango devuelve las `limit` filas más recientes igualmente en orden
    /// ascendente: se consultan descendente y se invierten en memoria. Los
    /// callers siempre reciben orden cronológico, haya filtro o no.
    pub async fn get_history(
        &self,
        vehicle_id: i64,
        query: &HistoryQuery,
    ) -> Result<Vec<VehicleHistoryRecord>, AppError> {
        let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).max(1);

        if query.since.is_some() || query.until.is_some() {
            let rows = sqlx::query_as::<_, VehicleHistoryRecord>(
                r#"
                SELECT * FROM vehicle_history
                WHERE vehicle_id = $1
                  AND ($2::timestamptz IS NULL OR time_indicator >= $2)
                  AND ($3::timestamptz IS NULL OR time_indicator <= $3)
                ORDER BY time_indicator ASC
                LIMIT $4
                "#,
            )
            .bind(vehicle_id)
            .bind(query.since)
            .bind(query.until)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            return Ok(rows);
        }

        let mut rows = sqlx::query_as::<_, VehicleHistoryRecord>(
            r#"
            SELECT * FROM vehicle_history
            WHERE vehicle_id = $1 AND time_indicator IS NOT NULL
            ORDER BY time_indicator DESC
            LIMIT $2
            "#,
        )
        .bind(vehicle_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    /// Historial paginado con el mismo contrato de orden que `get_history`
    /// y tope duro de 50 filas por página.
    pub async fn get_history_page(
        &self,
        vehicle_id: i64,
        query: &HistoryPageQuery,
    ) -> Result<HistoryPage, AppError> {
        let page = query.page.max(1);
        let page_size = clamp_page_size(query.page_size);
        let offset = (page - 1) * page_size;

        let (total, rows) = if query.since.is_some() || query.until.is_some() {
            let total: (i64,) = sqlx::query_as(
                r#"
                SELECT COUNT(*) FROM vehicle_history
                WHERE vehicle_id = $1
                  AND ($2::timestamptz IS NULL OR time_indicator >= $2)
                  AND ($3::timestamptz IS NULL OR time_indicator <= $3)
                "#,
            )
            .bind(vehicle_id)
            .bind(query.since)
            .bind(query.until)
            .fetch_one(&self.pool)
            .await?;

            let rows = sqlx::query_as::<_, VehicleHistoryRecord>(
                r#"
                SELECT * FROM vehicle_history
                WHERE vehicle_id = $1
                  AND ($2::timestamptz IS NULL OR time_indicator >= $2)
                  AND ($3::timestamptz IS NULL OR time_indicator <= $3)
                ORDER BY time_indicator ASC
                LIMIT $4 OFFSET $5
                "#,
            )
            .bind(vehicle_id)
            .bind(query.since)
            .bind(query.until)
            .bind(page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

            (total.0, rows)
        } else {
            let total: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM vehicle_history WHERE vehicle_id = $1 AND time_indicator IS NOT NULL",
            )
            .bind(vehicle_id)
            .fetch_one(&self.pool)
            .await?;

            // Sin rango las páginas avanzan de lo más reciente hacia atrás;
            // dentro de cada página el orden sigue siendo ascendente
            let mut rows = sqlx::query_as::<_, VehicleHistoryRecord>(
                r#"
                SELECT * FROM vehicle_history
                WHERE vehicle_id = $1 AND time_indicator IS NOT NULL
                ORDER BY time_indicator DESC
                LIMIT $2 OFFSET $3
                "#,
            )
            .bind(vehicle_id)
            .bind(page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
            rows.reverse();

            (total.0, rows)
        };

        Ok(HistoryPage {
            rows,
            total,
            page,
            page_size,
        })
    }

    /// Poda por retención: borra historial con `time_indicator` más viejo que
    /// `days` días. No-op para `days` no positivos; las filas sin timestamp
    /// nunca se borran por este camino.
    pub async fn delete_history_older_than(&self, days: i64) -> Result<u64, AppError> {
        if days <= 0 {
            return Ok(0);
        }

        let cutoff = Utc::now() - Duration::days(days);
        let result = sqlx::query(
            "DELETE FROM vehicle_history WHERE time_indicator IS NOT NULL AND time_indicator < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Contadores acumulativos de la primera fila de historial de cada
    /// vehículo dentro del día local (UTC+3) en curso: la línea base de los
    /// contadores diarios.
    pub async fn get_today_start_values(
        &self,
    ) -> Result<HashMap<i64, CumulativeCounters>, AppError> {
        let day_start = local_day_start(Utc::now(), LOCAL_UTC_OFFSET_HOURS);
        let day_end = day_start + Duration::days(1);

        let rows = sqlx::query_as::<_, TodayStartRow>(
            r#"
            SELECT DISTINCT ON (vehicle_id)
                vehicle_id, drive_time, work_time, idle_time, stop_time
            FROM vehicle_history
            WHERE time_indicator >= $1 AND time_indicator < $2
            ORDER BY vehicle_id, time_indicator ASC
            "#,
        )
        .bind(day_start)
        .bind(day_end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.vehicle_id,
                    CumulativeCounters {
                        drive_time: row.drive_time.unwrap_or(0),
                        work_time: row.work_time.unwrap_or(0),
                        idle_time: row.idle_time.unwrap_or(0),
                        stop_time: row.stop_time.unwrap_or(0),
                    },
                )
            })
            .collect())
    }
}

/// Aplica el tope duro de 50 filas por página.
pub fn clamp_page_size(requested: i64) -> i64 {
    requested.clamp(1, MAX_PAGE_SIZE)
}
