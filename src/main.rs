use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{error, info};
use dotenvy::dotenv;

use fleet_telemetry::clients::{GpsBuddyClient, TokenCache};
use fleet_telemetry::config::database::{ensure_schema, DatabaseConfig};
use fleet_telemetry::config::environment::EnvironmentConfig;
use fleet_telemetry::repositories::TelemetryRepository;
use fleet_telemetry::services::{
    LogNotificationSink, RefreshService, SpeedAlertConfig, SpeedAlertService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Cargar variables de entorno
    dotenv().ok();

    // Configurar logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("🛰️ Fleet Telemetry - Pipeline GPSBuddy");
    info!("======================================");

    // Configuración: las credenciales faltantes abortan acá, con la lista enumerada
    let config = match EnvironmentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Error de configuración: {}", e);
            return Err(anyhow::anyhow!("Error de configuración: {}", e));
        }
    };

    // Inicializar base de datos
    let db_config = match DatabaseConfig::from_env() {
        Ok(db_config) => db_config,
        Err(e) => {
            error!("❌ Error de configuración: {}", e);
            return Err(anyhow::anyhow!("Error de configuración: {}", e));
        }
    };
    let pool = match db_config.create_pool().await {
        Ok(pool) => pool,
        Err(e) => {
            error!("❌ Error conectando a la base de datos: {}", e);
            return Err(anyhow::anyhow!("Error de base de datos: {}", e));
        }
    };
    ensure_schema(&pool).await?;
    info!("✅ PostgreSQL conectado y schema verificado");

    // Armar el pipeline
    let token_cache = Arc::new(TokenCache::new());
    let client = Arc::new(GpsBuddyClient::new(config.clone(), token_cache)?);
    let repository = TelemetryRepository::new(pool);
    let signals = Arc::new(Mutex::new(SpeedAlertService::new(
        SpeedAlertConfig::from_environment(&config),
    )));
    let sink = Arc::new(LogNotificationSink);
    let service = Arc::new(RefreshService::new(
        client,
        repository,
        signals,
        sink,
        config.history_retention_days,
    ));

    info!("🔄 Ciclo completo cada {}s", config.refresh_interval_secs);
    info!("🚨 Chequeo de velocidad cada {}s", config.speed_check_interval_secs);
    info!("🗂️ Retención de historial: {} días", config.history_retention_days);
    info!("🚦 Límite de velocidad: {} km/h", config.speed_limit_kmh);

    // Las dos cadencias corren como tasks independientes; cada una saltea su
    // propia invocación previa si sigue en vuelo
    let refresh_handle = {
        let service = service.clone();
        let mut interval = tokio::time::interval(Duration::from_secs(config.refresh_interval_secs));
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                if let Err(e) = service.refresh_once().await {
                    error!("❌ Refresh falló: {:#}", e);
                }
            }
        })
    };

    let speed_handle = {
        let service = service.clone();
        let mut interval =
            tokio::time::interval(Duration::from_secs(config.speed_check_interval_secs));
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                if let Err(e) = service.check_speed_only().await {
                    error!("❌ Chequeo de velocidad falló: {:#}", e);
                }
            }
        })
    };

    shutdown_signal().await;
    refresh_handle.abort();
    speed_handle.abort();

    info!("👋 Pipeline terminado");
    Ok(())
}

/// Señal de apagado graceful
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("🛑 Señal Ctrl+C recibida, apagando pipeline...");
        },
        _ = terminate => {
            info!("🛑 Señal de terminación recibida, apagando pipeline...");
        },
    }
}
