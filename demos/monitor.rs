use std::sync::Arc;

use smart_envi::{Config, Coordinator, EnviClient, TemperatureUnit};

#[tokio::main]
async fn main() -> smart_envi::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    let client = Arc::new(EnviClient::from_config(&config)?);

    let coordinator = Arc::new(
        Coordinator::builder(client)
            .poll_interval(config.poll_interval)
            .on_event(|event| {
                println!("{event:?}");
            })
            .on_update(|aggregate| {
                for device in aggregate.iter() {
                    let ambient = device
                        .ambient_temperature
                        .map(|t| format!("{t} ({:.1}\u{00b0}C)", t.in_unit(TemperatureUnit::Celsius)))
                        .unwrap_or_else(|| "-".to_string());
                    let target = device
                        .target_temperature
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "[{}] {} | now {} | target {} | {}{}",
                        device.id,
                        device.name,
                        ambient,
                        target,
                        device.mode.map(|m| m.to_string()).unwrap_or_default(),
                        if device.online { "" } else { " | OFFLINE" },
                    );
                }
            })
            .build()?,
    );

    println!("Polling every {}s, Ctrl-C to stop", config.poll_interval.as_secs());
    let handle = coordinator.start();
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Signal handler failed: {e}");
    }
    handle.stop().await;
    Ok(())
}
