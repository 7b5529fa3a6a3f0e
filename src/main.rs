//! Demo accessory: a lightbulb served over HAP.

use std::sync::Arc;

use hap_core::accessory::{type_tag, Accessory, Characteristic, Service};
use hap_core::store::FsStore;
use hap_server::Server;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let listen = args.next().unwrap_or_else(|| "0.0.0.0:51826".to_string());
    let db = args.next().unwrap_or_else(|| "./db".to_string());
    let pin = std::env::var("HAP_PIN").unwrap_or_else(|_| "031-45-154".to_string());

    let mut bulb = Accessory::new(1, "Demo Lamp", "hap-rs", "LED-1", "0001");
    bulb.add_service(
        Service::new(type_tag::LIGHTBULB)
            .add_characteristic(Characteristic::bool(type_tag::ON, false).on_write(Box::new(
                |value, ctx| {
                    info!(?value, from = ?ctx.map(|c| c.remote_addr.clone()), "lamp switched");
                },
            )))
            .add_characteristic(
                Characteristic::new(type_tag::BRIGHTNESS, "int", &["pr", "pw", "ev"])
                    .with_unit("percentage")
                    .with_range(0.into(), 100.into(), 1.into())
                    .with_value(100.into()),
            ),
    );

    let store = FsStore::new(&db)?;
    let server = Arc::new(Server::new(store, vec![bulb], &pin)?);
    info!(device_id = %server.device_id(), %listen, "starting accessory");

    let listener = TcpListener::bind(&listen).await?;
    server.run(listener).await?;
    Ok(())
}
