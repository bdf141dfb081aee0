use axum::{extract::Path, http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_modbus::prelude::*;

use shelly_grid_meter::{
    modbus_server, AuxiliaryReader, Config, CycleOutcome, DeviceIdentity, HttpPropertyBus,
    PublishedState, ShellyEmClient, StateHandle, UpdateScheduler,
};

/// Mock Shelly EM serving `/status`
struct MockShellyServer {
    power: Mutex<f64>,
    should_fail: AtomicBool,
    request_count: AtomicU32,
}

impl MockShellyServer {
    fn new() -> Self {
        Self {
            power: Mutex::new(0.0),
            should_fail: AtomicBool::new(false),
            request_count: AtomicU32::new(0),
        }
    }

    fn set_power(&self, power: f64) {
        *self.power.lock().unwrap() = power;
    }

    fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::Relaxed);
    }

    fn create_router(self: Arc<Self>) -> Router {
        Router::new().route(
            "/status",
            get(move || {
                let server = self.clone();
                async move {
                    server.request_count.fetch_add(1, Ordering::Relaxed);
                    if server.should_fail.load(Ordering::Relaxed) {
                        return Err(StatusCode::SERVICE_UNAVAILABLE);
                    }
                    let power = *server.power.lock().unwrap();
                    Ok(Json(json!({
                        "mac": "C45BBE6A1F2D",
                        "emeters": [{
                            "power": power,
                            "reactive": 0.0,
                            "voltage": 230.0,
                            "is_valid": true,
                            "total": 1_523_400.0,
                            "total_returned": 88_000.0
                        }]
                    })))
                }
            }),
        )
    }
}

/// Mock property bus bridge
struct MockBusServer {
    values: Mutex<HashMap<String, f64>>,
}

impl MockBusServer {
    fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }

    fn set_value(&self, key: &str, value: f64) {
        self.values.lock().unwrap().insert(key.to_string(), value);
    }

    fn create_router(self: Arc<Self>) -> Router {
        Router::new().route(
            "/value/*key",
            get(move |Path(key): Path<String>| {
                let server = self.clone();
                async move {
                    match server.values.lock().unwrap().get(&key) {
                        Some(value) => Ok(Json(json!({ "value": value }))),
                        None => Err(StatusCode::NOT_FOUND),
                    }
                }
            }),
        )
    }
}

async fn start_http(router: Router) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tokio::spawn(async move {
        let server = axum::serve(listener, router);
        tokio::select! {
            _ = server => {},
            _ = shutdown_rx => {},
        }
    });

    (addr, shutdown_tx)
}

fn config(shelly: SocketAddr, bus_url: &str, consider_inverter: bool) -> Config {
    Config::from_toml_str(&format!(
        r#"
        log_level = "debug"

        [device]
        role = "grid"
        device_instance = 40
        custom_name = "Test grid meter"
        sign_of_life_minutes = 5

        [meter]
        access_type = "OnPremise"
        host = "{shelly}"

        [auxiliary]
        bus_url = "{bus_url}"
        consider_inverter = {consider_inverter}
        "#
    ))
    .unwrap()
}

async fn build_scheduler(
    config: &Config,
) -> UpdateScheduler<ShellyEmClient, HttpPropertyBus> {
    let meter = ShellyEmClient::new(&config.meter).unwrap();
    let serial = meter.fetch_serial().await.unwrap();
    let identity = DeviceIdentity {
        service: config.identity(),
        custom_name: config.device.custom_name.clone(),
        position: config.device.position,
        serial,
        line: config.meter.line,
    };
    let state = StateHandle::new(PublishedState::new(&identity));
    let bus = HttpPropertyBus::new(&config.auxiliary.bus_url).unwrap();
    UpdateScheduler::new(
        meter,
        AuxiliaryReader::new(bus, &config.auxiliary),
        state,
        config.device.sign_of_life,
    )
}

async fn start_modbus(state: StateHandle) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(modbus_server::serve(listener, state));
    addr
}

fn u16_pair_to_f32(high: u16, low: u16) -> f32 {
    f32::from_bits(((high as u32) << 16) | (low as u32))
}

/// Reads the update index and the eight published floats.
async fn read_published(meter_addr: SocketAddr) -> (u16, Vec<f32>) {
    let mut ctx = tcp::connect(meter_addr).await.unwrap();
    let regs = ctx.read_holding_registers(0, 17).await.unwrap().unwrap();
    let floats = regs[1..]
        .chunks_exact(2)
        .map(|pair| u16_pair_to_f32(pair[0], pair[1]))
        .collect();
    (regs[0], floats)
}

// float offsets in `read_published`
const AC_POWER: usize = 0;
const AC_FORWARD: usize = 1;
const LINE_POWER: usize = 5;
const LINE_FORWARD: usize = 6;

#[tokio::test]
async fn test_full_cycle_over_modbus() {
    let shelly = Arc::new(MockShellyServer::new());
    let bus = Arc::new(MockBusServer::new());
    shelly.set_power(1000.0);
    bus.set_value("com.victronenergy.evcharger.http_43/Ac/L1/Power", 500.0);
    bus.set_value("com.victronenergy.vebus.ttyUSB0/Ac/ActiveIn/P", 200.0);

    let (shelly_addr, _shelly_shutdown) = start_http(shelly.clone().create_router()).await;
    let (bus_addr, _bus_shutdown) = start_http(bus.clone().create_router()).await;

    let cfg = config(shelly_addr, &format!("http://{bus_addr}"), false);
    let mut scheduler = build_scheduler(&cfg).await;
    let meter_addr = start_modbus(scheduler.state().clone()).await;

    // Inverter excluded: 1000 + 500
    assert_eq!(scheduler.run_cycle().await, CycleOutcome::Updated);
    let (index, values) = read_published(meter_addr).await;
    assert_eq!(index, 1);
    assert_eq!(values[AC_POWER], 1500.0);
    assert_eq!(values[LINE_POWER], 1500.0);
    assert_eq!(values[LINE_FORWARD], 1523.4);
    let forward_after_first = values[AC_FORWARD];
    assert!(forward_after_first > 0.0);

    // Outage: line power zeroed, totals frozen
    shelly.set_should_fail(true);
    assert_eq!(scheduler.run_cycle().await, CycleOutcome::Degraded);
    let totals_during_outage = scheduler.totals();
    let (index, values) = read_published(meter_addr).await;
    assert_eq!(index, 2);
    assert_eq!(values[LINE_POWER], 0.0);
    assert_eq!(values[AC_POWER], 1500.0);
    assert_eq!(values[AC_FORWARD], forward_after_first);

    // Recovery resumes from the frozen totals
    shelly.set_should_fail(false);
    shelly.set_power(-2000.0);
    assert_eq!(scheduler.run_cycle().await, CycleOutcome::Updated);
    assert_eq!(scheduler.totals().forward, totals_during_outage.forward);
    assert!(scheduler.totals().reverse > 0.0);
    let (index, values) = read_published(meter_addr).await;
    assert_eq!(index, 3);
    assert_eq!(values[AC_POWER], -1500.0);

    assert!(shelly.request_count.load(Ordering::Relaxed) >= 4);
}

#[tokio::test]
async fn test_modbus_write_is_overwritten() {
    let shelly = Arc::new(MockShellyServer::new());
    shelly.set_power(750.0);
    let (shelly_addr, _shelly_shutdown) = start_http(shelly.clone().create_router()).await;

    let cfg = config(shelly_addr, "", false);
    let mut scheduler = build_scheduler(&cfg).await;
    let meter_addr = start_modbus(scheduler.state().clone()).await;
    scheduler.run_cycle().await;

    let bits = 12345.0f32.to_bits();
    let mut ctx = tcp::connect(meter_addr).await.unwrap();
    ctx.write_multiple_registers(1, &[(bits >> 16) as u16, (bits & 0xFFFF) as u16])
        .await
        .unwrap()
        .unwrap();
    let (_, values) = read_published(meter_addr).await;
    assert_eq!(values[AC_POWER], 12345.0);

    // writing the update index is refused
    let refused = ctx.write_multiple_registers(0, &[7, 0]).await.unwrap();
    assert!(refused.is_err());

    scheduler.run_cycle().await;
    let (index, values) = read_published(meter_addr).await;
    assert_eq!(index, 2);
    assert_eq!(values[AC_POWER], 750.0);
}

#[tokio::test]
async fn test_inverter_inclusion_and_missing_bus() {
    let shelly = Arc::new(MockShellyServer::new());
    let bus = Arc::new(MockBusServer::new());
    shelly.set_power(300.0);
    bus.set_value("com.victronenergy.evcharger.http_43/Ac/L1/Power", 1100.0);
    bus.set_value("com.victronenergy.vebus.ttyUSB0/Ac/ActiveIn/P", -400.0);

    let (shelly_addr, _shelly_shutdown) = start_http(shelly.clone().create_router()).await;
    let (bus_addr, _bus_shutdown) = start_http(bus.clone().create_router()).await;

    let cfg = config(shelly_addr, &format!("http://{bus_addr}"), true);
    let mut scheduler = build_scheduler(&cfg).await;
    scheduler.run_cycle().await;
    assert_eq!(
        scheduler.state().lock().get_f64("/Ac/Power"),
        Some(300.0 + 1100.0 - 400.0)
    );

    // no bridge configured: meter power only
    let cfg = config(shelly_addr, "", true);
    let mut scheduler = build_scheduler(&cfg).await;
    scheduler.run_cycle().await;
    assert_eq!(scheduler.state().lock().get_f64("/Ac/Power"), Some(300.0));

    // bridge up but EV charger not published yet
    bus.values.lock().unwrap().clear();
    let cfg = config(shelly_addr, &format!("http://{bus_addr}"), true);
    let mut scheduler = build_scheduler(&cfg).await;
    assert_eq!(scheduler.run_cycle().await, CycleOutcome::Updated);
    assert_eq!(scheduler.state().lock().get_f64("/Ac/Power"), Some(300.0));
}

#[tokio::test]
async fn test_startup_requires_serial() {
    let (addr, _shutdown) = start_http(Router::new().route(
        "/status",
        get(|| async { Json(json!({ "emeters": [] })) }),
    ))
    .await;

    let cfg = config(addr, "", false);
    let meter = ShellyEmClient::new(&cfg.meter).unwrap();
    let err = meter.fetch_serial().await.unwrap_err();
    assert_eq!(err.to_string(), "response does not contain 'mac' attribute");
}
