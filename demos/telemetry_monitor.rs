use std::sync::Arc;
use tracing::{error, info};
use wftnp::{
    ActivityState, ConnectionState, Result, TelemetryRecord, TrainerConfig, TrainerDevice,
    TrainerHandler, DEFAULT_PORT,
};

struct Monitor;

#[async_trait::async_trait]
impl TrainerHandler for Monitor {
    async fn on_telemetry(&self, record: TelemetryRecord, activity: ActivityState) {
        match activity {
            ActivityState::Active => info!(
                "🚴 {:>5.1} km/h  {:>5.1} rpm  {:>4.0} W",
                record.speed_kmh.unwrap_or(0.0),
                record.cadence_rpm.unwrap_or(0.0),
                record.power_w.unwrap_or(0.0)
            ),
            ActivityState::Sleeping => info!("😴 Trainer is idle (heartbeat)"),
        }
    }

    async fn on_connection_state_changed(&self, state: ConnectionState) {
        info!("🔗 Connection: {state}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "192.168.1.40".to_string());

    info!("📊 wftnp Telemetry Monitor");
    info!("Connecting to trainer at {host}:{DEFAULT_PORT}...");

    let trainer = match TrainerDevice::connect(
        host,
        DEFAULT_PORT,
        TrainerConfig::default(),
        Arc::new(Monitor),
    )
    .await
    {
        Ok(trainer) => trainer,
        Err(e) => {
            error!("❌ Failed to connect: {e}");
            return Err(e);
        }
    };

    info!("✅ Monitoring; press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Signal handler failed: {e}");
    }

    info!("🔌 Disconnecting...");
    trainer.shutdown().await;
    Ok(())
}
