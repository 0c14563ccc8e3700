use anyhow::{Context, Result};
use dtm_driver_gozero::DRIVER_NAME;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::init as tracing_init;

const ENV_TARGET: &str = "DTM_DRIVER_TARGET";
const ENV_ENDPOINT: &str = "DTM_DRIVER_ENDPOINT";
const DEFAULT_ENDPOINT: &str = "127.0.0.1:36790";
const RESOLVE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting driver-publisher...");

    dtm_driver_gozero::register();
    let driver = dtm_driver::use_driver(DRIVER_NAME)?;
    info!("Using driver {}", driver.name());

    let target = std::env::var(ENV_TARGET).unwrap_or_default();
    let endpoint = std::env::var(ENV_ENDPOINT).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

    driver
        .register_service(&target, &endpoint)
        .await
        .with_context(|| format!("registering {} under {:?}", endpoint, target))?;

    if target.is_empty() {
        warn!("{} not set, {} is not published", ENV_TARGET, endpoint);
    }

    // Addresses passed as arguments are split the way branch calls would be
    for address in std::env::args().skip(1) {
        match driver.parse_server_method(&address) {
            Ok((server, method)) => info!("{} -> server {:?}, method {:?}", address, server, method),
            Err(e) => error!("Cannot split {}: {}", address, e),
        }
    }

    // Periodically resolve the target until interrupted
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutting down driver-publisher");
                zero_discov::consul::deregister_all().await;
                return Ok(());
            }
            _ = tokio::time::sleep(RESOLVE_INTERVAL), if !target.is_empty() => {
                match zero_discov::resolver::resolve(&target).await {
                    Ok(endpoints) => {
                        info!("{} resolves to {} endpoints", target, endpoints.len());
                        debug!("Endpoints: {:?}", endpoints);
                    }
                    Err(e) => {
                        error!("Error resolving {}: {}", target, e);
                    }
                }
            }
        }
    }
}
