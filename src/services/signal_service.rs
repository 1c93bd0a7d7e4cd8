//! Señales derivadas: contadores diarios y violaciones de velocidad
//!
//! Este módulo calcula los deltas diarios contra la línea base del inicio
//! del día local y detecta excesos de velocidad con ventana rodante de
//! máxima y debounce por vehículo. El estado de alertas vive solo en el
//! proceso: un reinicio lo pierde, las alertas son best-effort.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::models::{CumulativeCounters, VehicleTelemetry};
use crate::repositories::TelemetryRepository;
use crate::utils::errors::AppError;
use crate::utils::time::local_time_label;

/// Canal fijo de entrega de alertas de conductores
pub const DRIVER_ALERTS_CHANNEL: &str = "driver-alerts";

/// Configuración del detector de excesos de velocidad
#[derive(Debug, Clone)]
pub struct SpeedAlertConfig {
    /// Umbral fijo de velocidad en km/h
    pub speed_limit_kmh: i32,
    /// Ventana rodante de velocidad máxima
    pub window: Duration,
    /// Cooldown entre alertas del mismo vehículo
    pub cooldown: Duration,
    /// Retención de entradas de debounce (2× cooldown)
    pub debounce_retention: Duration,
}

impl Default for SpeedAlertConfig {
    fn default() -> Self {
        Self {
            speed_limit_kmh: 94,
            window: Duration::minutes(5),
            cooldown: Duration::minutes(5),
            debounce_retention: Duration::minutes(10),
        }
    }
}

impl SpeedAlertConfig {
    pub fn from_environment(config: &crate::config::environment::EnvironmentConfig) -> Self {
        let cooldown = Duration::seconds(config.speed_alert_cooldown_secs);
        Self {
            speed_limit_kmh: config.speed_limit_kmh,
            window: Duration::seconds(config.speed_window_secs),
            cooldown,
            debounce_retention: cooldown * 2,
        }
    }
}

/// Entrada de la ventana rodante de velocidad máxima
#[derive(Debug, Clone)]
struct MaxSpeedEntry {
    max_speed: i32,
    plate: Option<String>,
    driver: Option<String>,
    location: Option<String>,
    observed_at: DateTime<Utc>,
}

/// Alerta lista para el sink de notificaciones
#[derive(Debug, Clone, Serialize)]
pub struct SpeedAlert {
    pub vehicle_id: i64,
    pub text: String,
    pub metadata: Value,
}

/// Detector de excesos de velocidad con estado local al proceso.
///
/// Las dos tablas rodantes se barren en cada poll, lo que acota la memoria
/// al tamaño de la flota activa. El reloj se recibe por parámetro.
pub struct SpeedAlertService {
    config: SpeedAlertConfig,
    max_speed_window: HashMap<i64, MaxSpeedEntry>,
    last_alert_at: HashMap<i64, DateTime<Utc>>,
}

impl SpeedAlertService {
    pub fn new(config: SpeedAlertConfig) -> Self {
        Self {
            config,
            max_speed_window: HashMap::new(),
            last_alert_at: HashMap::new(),
        }
    }

    /// Corre la detección sobre las lecturas de un poll y devuelve las
    /// alertas que pasaron el debounce.
    pub fn check_vehicles(
        &mut self,
        vehicles: &[VehicleTelemetry],
        now: DateTime<Utc>,
    ) -> Vec<SpeedAlert> {
        self.sweep(now);

        let mut alerts = Vec::new();
        for vehicle in vehicles {
            let Some(velocity) = vehicle.velocity else {
                continue;
            };
            if velocity <= self.config.speed_limit_kmh {
                continue;
            }

            self.track_max_speed(vehicle, velocity, now);

            let debounced = self
                .last_alert_at
                .get(&vehicle.vehicle_id)
                .map(|last| now - *last < self.config.cooldown)
                .unwrap_or(false);
            if debounced {
                continue;
            }

            self.last_alert_at.insert(vehicle.vehicle_id, now);
            alerts.push(self.build_alert(vehicle, velocity, now));
        }
        alerts
    }

    fn track_max_speed(&mut self, vehicle: &VehicleTelemetry, velocity: i32, now: DateTime<Utc>) {
        let replace = match self.max_speed_window.get(&vehicle.vehicle_id) {
            None => true,
            Some(entry) => {
                now - entry.observed_at > self.config.window || velocity > entry.max_speed
            }
        };
        if replace {
            self.max_speed_window.insert(
                vehicle.vehicle_id,
                MaxSpeedEntry {
                    max_speed: velocity,
                    plate: vehicle.plate.clone(),
                    driver: vehicle.driver_name.clone(),
                    location: vehicle.location.clone(),
                    observed_at: now,
                },
            );
        }
    }

    fn build_alert(
        &self,
        vehicle: &VehicleTelemetry,
        velocity: i32,
        now: DateTime<Utc>,
    ) -> SpeedAlert {
        let tracked_max = self
            .max_speed_window
            .get(&vehicle.vehicle_id)
            .map(|entry| entry.max_speed)
            .unwrap_or(velocity);

        let plate = vehicle.plate.clone().unwrap_or_else(|| "sin matrícula".to_string());
        let driver = vehicle.driver_name.clone().unwrap_or_else(|| "desconocido".to_string());
        let location = vehicle.location.clone().unwrap_or_else(|| "ubicación desconocida".to_string());

        let mut text = format!("🚨 Exceso de velocidad: {} a {} km/h", plate, velocity);
        if tracked_max > velocity {
            text.push_str(&format!(" (máx. {} km/h en la ventana)", tracked_max));
        }
        text.push_str(&format!(
            " — conductor {}, {}, {}",
            driver,
            location,
            local_time_label(now)
        ));

        let metadata = json!({
            "type": "speed_violation",
            "vehicle_id": vehicle.vehicle_id,
            "plate": vehicle.plate,
            "velocity": velocity,
            "max_speed": tracked_max,
            "driver": vehicle.driver_name,
            "location": vehicle.location,
            "timestamp": now.to_rfc3339(),
        });

        SpeedAlert {
            vehicle_id: vehicle.vehicle_id,
            text,
            metadata,
        }
    }

    /// Barrido de las tablas rodantes: entradas de máxima más viejas que la
    /// ventana y entradas de debounce más viejas que 2× cooldown.
    fn sweep(&mut self, now: DateTime<Utc>) {
        let window = self.config.window;
        self.max_speed_window
            .retain(|_, entry| now - entry.observed_at <= window);

        let retention = self.config.debounce_retention;
        self.last_alert_at.retain(|_, last| now - *last <= retention);
    }
}

/// Contadores diarios derivados de un vehículo
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DailyCounters {
    pub daily_drive_time: i64,
    pub daily_work_time: i64,
    pub daily_idle_time: i64,
    pub daily_stop_time: i64,
}

/// Fila del reporte diario de flota
#[derive(Debug, Clone, Serialize)]
pub struct FleetDailyCounters {
    pub vehicle_id: i64,
    pub plate: Option<String>,
    pub counters: DailyCounters,
}

/// Delta diario contra la línea base del inicio del día local.
///
/// Sin línea base el diario es el acumulado actual (se asume que el vehículo
/// empezó su día ahora). Un reset del contador nunca produce un delta
/// negativo: se recorta a 0.
pub fn daily_counters(
    current: &CumulativeCounters,
    today_start: Option<&CumulativeCounters>,
) -> DailyCounters {
    match today_start {
        None => DailyCounters {
            daily_drive_time: current.drive_time.max(0),
            daily_work_time: current.work_time.max(0),
            daily_idle_time: current.idle_time.max(0),
            daily_stop_time: current.stop_time.max(0),
        },
        Some(start) => DailyCounters {
            daily_drive_time: (current.drive_time - start.drive_time).max(0),
            daily_work_time: (current.work_time - start.work_time).max(0),
            daily_idle_time: (current.idle_time - start.idle_time).max(0),
            daily_stop_time: (current.stop_time - start.stop_time).max(0),
        },
    }
}

/// Camino de lectura del reporte diario: junta el último estado de la flota
/// con las líneas base del día en curso.
pub async fn daily_counters_for_fleet(
    repository: &TelemetryRepository,
) -> Result<Vec<FleetDailyCounters>, AppError> {
    let last_states = repository.get_last_all().await?;
    let baselines = repository.get_today_start_values().await?;

    Ok(last_states
        .iter()
        .map(|state| {
            let current = CumulativeCounters::from_last_state(state);
            FleetDailyCounters {
                vehicle_id: state.vehicle_id,
                plate: state.plate.clone(),
                counters: daily_counters(&current, baselines.get(&state.vehicle_id)),
            }
        })
        .collect())
}
