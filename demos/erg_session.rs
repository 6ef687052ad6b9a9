use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info};
use wftnp::{
    ActivityState, Result, TelemetryRecord, TrainerConfig, TrainerDevice, TrainerHandler,
    DEFAULT_PORT,
};

struct PowerLogger;

#[async_trait::async_trait]
impl TrainerHandler for PowerLogger {
    async fn on_telemetry(&self, record: TelemetryRecord, _activity: ActivityState) {
        if let Some(power) = record.power_w {
            info!(
                "  {:>4.0} W  {:>5.1} km/h  {:>5.1} rpm",
                power,
                record.speed_kmh.unwrap_or(0.0),
                record.cadence_rpm.unwrap_or(0.0)
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "192.168.1.40".to_string());

    info!("🚴 wftnp ERG Session Example");
    info!("Connecting to trainer at {host}:{DEFAULT_PORT}...");

    let trainer = match TrainerDevice::connect(
        host,
        DEFAULT_PORT,
        TrainerConfig::default(),
        Arc::new(PowerLogger),
    )
    .await
    {
        Ok(trainer) => {
            let info = trainer.device_information().await;
            info!(
                "✅ Connected to: {} {}",
                info.manufacturer.as_deref().unwrap_or("unknown"),
                info.model.as_deref().unwrap_or("trainer")
            );
            trainer
        }
        Err(e) => {
            error!("❌ Failed to connect: {e}");
            return Err(e);
        }
    };

    // Warm up at 120 W, then step up to 200 W
    info!("⚡ Warming up at 120 W...");
    trainer.set_erg_watts(120).await?;
    sleep(Duration::from_secs(30)).await;

    for target in [150, 180, 200] {
        info!("📈 Stepping up to {target} W...");
        if let Err(e) = trainer.set_erg_watts(target).await {
            error!("❌ Failed to set target: {e}");
            break;
        }
        sleep(Duration::from_secs(30)).await;
    }

    // Cool down on a gentle simulated descent
    info!("📉 Cooling down at -1.5% grade...");
    trainer.set_grade(-1.5).await?;
    sleep(Duration::from_secs(30)).await;

    info!("🔌 Disconnecting...");
    trainer.shutdown().await;
    info!("🎉 Session complete!");
    Ok(())
}
