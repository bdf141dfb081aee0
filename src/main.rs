use anyhow::Context;
use shelly_grid_meter::{
    modbus_server, AuxiliaryReader, Config, DeviceIdentity, HttpPropertyBus, PublishedState,
    ShellyEmClient, StateHandle, UpdateScheduler,
};
use std::env;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("METER_CONFIG").ok())
        .unwrap_or_else(|| "config.toml".into());

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            error!("{e}");
            std::process::exit(1);
        }
    };
    init_logging(config.log_directive());

    if let Err(e) = run(config).await {
        error!(critical = true, "{e:#}");
        std::process::exit(1);
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(config: Config) -> anyhow::Result<()> {
    let service = config.identity();
    info!(
        service = %service.service_name,
        device_instance = service.device_instance,
        "Start"
    );

    let meter = ShellyEmClient::new(&config.meter)?;
    let serial = meter
        .fetch_serial()
        .await
        .with_context(|| format!("reading serial from {}", meter.status_url()))?;
    info!(%serial, "connected to Shelly EM");

    let identity = DeviceIdentity {
        service,
        custom_name: config.device.custom_name.clone(),
        position: config.device.position,
        serial,
        line: config.meter.line,
    };
    let state = StateHandle::new(PublishedState::new(&identity));

    let bus = HttpPropertyBus::new(&config.auxiliary.bus_url)?;
    let auxiliary = AuxiliaryReader::new(bus, &config.auxiliary);
    let scheduler = UpdateScheduler::new(
        meter,
        auxiliary,
        state.clone(),
        config.device.sign_of_life,
    );

    match config.publish.listen.as_deref() {
        Some(listen) => {
            let listener = TcpListener::bind(listen)
                .await
                .with_context(|| format!("binding Modbus listener on {listen}"))?;
            tokio::select! {
                res = modbus_server::serve(listener, state) => res?,
                () = scheduler.run() => {}
            }
        }
        None => scheduler.run().await,
    }
    Ok(())
}
