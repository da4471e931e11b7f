use smart_envi::{Config, Coordinator, EnviClient};

/// Run with: cargo test --test integration -- --ignored
/// Requires ENVI_USERNAME and ENVI_PASSWORD for a real account. Read-only.
#[tokio::test]
#[ignore]
async fn live_account_round_trip() {
    let config = Config::from_env().expect("ENVI_USERNAME / ENVI_PASSWORD must be set");
    let client = std::sync::Arc::new(EnviClient::from_config(&config).expect("client"));

    let ids = client.list_devices().await.expect("device list");
    println!("account has {} heaters", ids.len());

    let coordinator = Coordinator::builder(client.clone())
        .poll_interval(config.poll_interval)
        .build()
        .expect("coordinator");
    let report = coordinator.refresh_all().await.expect("first cycle");
    println!("{report:?}");

    assert_eq!(report.succeeded + report.failed, ids.len());
    for snap in coordinator.get_all().iter() {
        println!(
            "{} [{}] online={} ambient={:?} target={:?} mode={:?}",
            snap.name, snap.id, snap.online, snap.ambient_temperature, snap.target_temperature, snap.mode
        );
    }

    let schedules = client.list_schedules().await.expect("schedule list");
    println!("{} schedules", schedules.len());
}
