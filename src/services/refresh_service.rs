//! Orquestador de refresh
//!
//! Este módulo coordina el ciclo de cada poll: fetch del upstream, persistencia
//! transaccional, chequeo de velocidad y reenvío de alertas al sink. Expone
//! además el camino liviano de solo-velocidad que corre en cadencia de
//! segundos sin inflar la tabla de historial.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::clients::{FetchMeta, TelemetrySource};
use crate::repositories::{TelemetryRepository, UpsertCounts};
use crate::services::notification_service::NotificationSink;
use crate::services::signal_service::{SpeedAlert, SpeedAlertService, DRIVER_ALERTS_CHANNEL};

/// Resultado de un ciclo completo de refresh
#[derive(Debug, Serialize)]
pub struct RefreshOutcome {
    pub meta: FetchMeta,
    pub persisted: UpsertCounts,
    pub alerts_sent: usize,
    pub history_pruned: u64,
}

/// Resultado del camino liviano de solo-velocidad
#[derive(Debug, Serialize)]
pub struct SpeedCheckOutcome {
    pub meta: FetchMeta,
    pub vehicles_checked: usize,
    pub alerts_sent: usize,
}

pub struct RefreshService {
    source: Arc<dyn TelemetrySource>,
    repository: TelemetryRepository,
    signals: Arc<Mutex<SpeedAlertService>>,
    sink: Arc<dyn NotificationSink>,
    retention_days: i64,
    // Serialización por cadencia: cada camino saltea su propia invocación
    // previa si sigue en vuelo, sin bloquear al otro
    refresh_guard: Mutex<()>,
    speed_guard: Mutex<()>,
}

impl RefreshService {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        repository: TelemetryRepository,
        signals: Arc<Mutex<SpeedAlertService>>,
        sink: Arc<dyn NotificationSink>,
        retention_days: i64,
    ) -> Self {
        Self {
            source,
            repository,
            signals,
            sink,
            retention_days,
            refresh_guard: Mutex::new(()),
            speed_guard: Mutex::new(()),
        }
    }

    /// Ciclo completo: fetch → persistir → chequear velocidad → reenviar
    /// alertas → podar retención. Devuelve `None` cuando la invocación previa
    /// de este camino sigue en vuelo (skip-if-busy).
    ///
    /// Un fallo de persistencia se propaga: un poll que no persistió nunca
    /// reporta éxito.
    pub async fn refresh_once(&self) -> Result<Option<RefreshOutcome>> {
        let Ok(_guard) = self.refresh_guard.try_lock() else {
            log::warn!("⏭️ Refresh anterior sigue en vuelo, salteando este ciclo");
            return Ok(None);
        };

        let fetch = self.source.fetch_live_vehicles().await?;
        let persisted = self.repository.upsert_last_and_history(&fetch.vehicles).await?;

        let alerts = {
            let mut signals = self.signals.lock().await;
            signals.check_vehicles(&fetch.vehicles, Utc::now())
        };
        let alerts_sent = self.dispatch_alerts(alerts).await;

        let history_pruned = self
            .repository
            .delete_history_older_than(self.retention_days)
            .await?;
        if history_pruned > 0 {
            log::info!("🧹 Retención: {} filas de historial podadas", history_pruned);
        }

        log::info!(
            "✅ Refresh {}: {} vehículos, {} filas de historial, {} alertas",
            fetch.meta.function_name,
            persisted.updated,
            persisted.history_inserted,
            alerts_sent
        );

        Ok(Some(RefreshOutcome {
            meta: fetch.meta,
            persisted,
            alerts_sent,
            history_pruned,
        }))
    }

    /// Camino liviano: fetch + chequeo de velocidad, sin persistencia.
    ///
    /// Comparte el detector con `refresh_once`; el debounce por umbral y
    /// tiempo evita alertas dobles sobre la misma lectura entre ambas
    /// cadencias.
    pub async fn check_speed_only(&self) -> Result<Option<SpeedCheckOutcome>> {
        let Ok(_guard) = self.speed_guard.try_lock() else {
            log::warn!("⏭️ Chequeo de velocidad anterior sigue en vuelo, salteando");
            return Ok(None);
        };

        let fetch = self.source.fetch_live_vehicles().await?;
        let vehicles_checked = fetch.vehicles.len();

        let alerts = {
            let mut signals = self.signals.lock().await;
            signals.check_vehicles(&fetch.vehicles, Utc::now())
        };
        let alerts_sent = self.dispatch_alerts(alerts).await;

        Ok(Some(SpeedCheckOutcome {
            meta: fetch.meta,
            vehicles_checked,
            alerts_sent,
        }))
    }

    /// Reenvío fire-and-forget: un sink caído no tumba el ciclo de poll.
    async fn dispatch_alerts(&self, alerts: Vec<SpeedAlert>) -> usize {
        let mut sent = 0;
        for alert in alerts {
            match self
                .sink
                .send_channel_message(DRIVER_ALERTS_CHANNEL, &alert.text, alert.metadata.clone())
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => {
                    log::warn!(
                        "⚠️ No se pudo entregar alerta del vehículo {}: {}",
                        alert.vehicle_id,
                        e
                    );
                }
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::LiveFetchResult;
    use crate::models::VehicleTelemetry;
    use crate::services::signal_service::SpeedAlertConfig;
    use async_trait::async_trait;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct StubSource {
        velocity: i32,
        fetches: AtomicUsize,
        hold: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl TelemetrySource for StubSource {
        async fn fetch_live_vehicles(&self) -> Result<LiveFetchResult> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            Ok(LiveFetchResult {
                vehicles: vec![VehicleTelemetry {
                    vehicle_id: 1,
                    plate: Some("34ABC123".to_string()),
                    driver_name: None,
                    latitude: None,
                    longitude: None,
                    velocity: Some(self.velocity),
                    address: None,
                    location: None,
                    direction: None,
                    time_indicator: None,
                    drive_time: None,
                    work_time: None,
                    idle_time: None,
                    stop_time: None,
                    total_distance: None,
                    start_km: None,
                    flags: None,
                    communication_ok: None,
                    color_code: None,
                }],
                meta: FetchMeta {
                    function_name: "StubLive".to_string(),
                    fetched_at: Utc::now(),
                },
            })
        }
    }

    struct CollectingSink {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl NotificationSink for CollectingSink {
        async fn send_channel_message(
            &self,
            channel: &str,
            text: &str,
            _metadata: serde_json::Value,
        ) -> Result<()> {
            self.sent.lock().await.push((channel.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn service_with(
        source: Arc<StubSource>,
        sink: Arc<CollectingSink>,
    ) -> RefreshService {
        // Pool perezoso: el camino de solo-velocidad nunca toca la base
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/fleet_telemetry_test")
            .unwrap();
        RefreshService::new(
            source,
            TelemetryRepository::new(pool),
            Arc::new(Mutex::new(SpeedAlertService::new(SpeedAlertConfig::default()))),
            sink,
            30,
        )
    }

    #[tokio::test]
    async fn test_check_speed_only_forwards_alert_to_channel() {
        let source = Arc::new(StubSource {
            velocity: 110,
            fetches: AtomicUsize::new(0),
            hold: None,
        });
        let sink = Arc::new(CollectingSink {
            sent: Mutex::new(Vec::new()),
        });
        let service = service_with(source.clone(), sink.clone());

        let outcome = service.check_speed_only().await.unwrap().unwrap();
        assert_eq!(outcome.vehicles_checked, 1);
        assert_eq!(outcome.alerts_sent, 1);

        let sent = sink.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, DRIVER_ALERTS_CHANNEL);
        assert!(sent[0].1.contains("110 km/h"));
    }

    #[tokio::test]
    async fn test_check_speed_only_debounces_across_invocations() {
        let source = Arc::new(StubSource {
            velocity: 110,
            fetches: AtomicUsize::new(0),
            hold: None,
        });
        let sink = Arc::new(CollectingSink {
            sent: Mutex::new(Vec::new()),
        });
        let service = service_with(source.clone(), sink.clone());

        let first = service.check_speed_only().await.unwrap().unwrap();
        assert_eq!(first.alerts_sent, 1);

        // Segunda corrida inmediata: misma violación, suprimida por cooldown
        let second = service.check_speed_only().await.unwrap().unwrap();
        assert_eq!(second.alerts_sent, 0);
        assert_eq!(sink.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_speed_path_skips_when_previous_in_flight() {
        let hold = Arc::new(Notify::new());
        let source = Arc::new(StubSource {
            velocity: 50,
            fetches: AtomicUsize::new(0),
            hold: Some(hold.clone()),
        });
        let sink = Arc::new(CollectingSink {
            sent: Mutex::new(Vec::new()),
        });
        let service = Arc::new(service_with(source.clone(), sink));

        let blocked = {
            let service = service.clone();
            tokio::spawn(async move { service.check_speed_only().await })
        };

        // Espera a que la primera invocación entre al fetch y quede retenida
        while source.fetches.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Con la previa en vuelo, la segunda invocación saltea sin fetch
        let skipped = service.check_speed_only().await.unwrap();
        assert!(skipped.is_none());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        hold.notify_one();
        let outcome = blocked.await.unwrap().unwrap();
        assert!(outcome.is_some());
    }
}
