//! Published state of the virtual meter.
//!
//! Every value lives under a hierarchical path (`/Ac/Power`,
//! `/Ac/L1/Energy/Forward`, ...). The update cycle is the only writer of
//! measurements; external writes are accepted on measurement paths but only
//! last until the next cycle overwrites them.

use crate::config::{Line, ServiceIdentity};
use crate::energy_integrator::EnergyTotals;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub const PRODUCT_NAME: &str = "Gridmeter em+goe+mp2";
pub const CONNECTION: &str = "Shelly EM HTTP JSON service";
/// ET340 energy meter, the closest match the GX device knows about.
pub const DEVICE_TYPE: i64 = 345;
pub const UPDATE_INDEX: &str = "/UpdateIndex";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    /// Path exists but carries no value.
    Empty,
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Empty => f.write_str("---"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    KiloWattHour,
    Ampere,
    Watt,
    Volt,
}

impl Unit {
    pub fn format(&self, value: f64) -> String {
        match self {
            Unit::KiloWattHour => format!("{value:.2} kWh"),
            Unit::Ampere => format!("{value:.1} A"),
            Unit::Watt => format!("{value:.1} W"),
            Unit::Volt => format!("{value:.1} V"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone)]
struct Item {
    value: Value,
    unit: Option<Unit>,
    writeable: bool,
}

/// Paths of the measurement values, which depend on the configured line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterPaths {
    pub power: String,
    pub energy_forward: String,
    pub energy_reverse: String,
    pub line_voltage: String,
    pub line_current: String,
    pub line_power: String,
    pub line_energy_forward: String,
    pub line_energy_reverse: String,
}

impl MeterPaths {
    pub fn new(line: Line) -> Self {
        Self {
            power: "/Ac/Power".into(),
            energy_forward: "/Ac/Energy/Forward".into(),
            energy_reverse: "/Ac/Energy/Reverse".into(),
            line_voltage: format!("/Ac/{line}/Voltage"),
            line_current: format!("/Ac/{line}/Current"),
            line_power: format!("/Ac/{line}/Power"),
            line_energy_forward: format!("/Ac/{line}/Energy/Forward"),
            line_energy_reverse: format!("/Ac/{line}/Energy/Reverse"),
        }
    }

    fn with_units(&self) -> [(&str, Unit); 8] {
        [
            (self.energy_forward.as_str(), Unit::KiloWattHour),
            (self.energy_reverse.as_str(), Unit::KiloWattHour),
            (self.power.as_str(), Unit::Watt),
            (self.line_voltage.as_str(), Unit::Volt),
            (self.line_current.as_str(), Unit::Ampere),
            (self.line_power.as_str(), Unit::Watt),
            (self.line_energy_forward.as_str(), Unit::KiloWattHour),
            (self.line_energy_reverse.as_str(), Unit::KiloWattHour),
        ]
    }
}

/// Static description of the device, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub service: ServiceIdentity,
    pub custom_name: String,
    pub position: u32,
    pub serial: String,
    pub line: Line,
}

/// Values computed by one successful cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurements {
    pub voltage: f64,
    pub current: f64,
    pub line_power: f64,
    pub line_energy: EnergyTotals,
    pub power: f64,
    pub energy: EnergyTotals,
}

impl Measurements {
    pub fn is_finite(&self) -> bool {
        [
            self.voltage,
            self.current,
            self.line_power,
            self.line_energy.forward,
            self.line_energy.reverse,
            self.power,
            self.energy.forward,
            self.energy.reverse,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

#[derive(Debug)]
pub struct PublishedState {
    items: BTreeMap<String, Item>,
    paths: MeterPaths,
}

impl PublishedState {
    pub fn new(identity: &DeviceIdentity) -> Self {
        let mut state = Self {
            items: BTreeMap::new(),
            paths: MeterPaths::new(identity.line),
        };

        state.add_static("/Mgmt/ProcessName", Value::Text(env!("CARGO_PKG_NAME").into()));
        state.add_static(
            "/Mgmt/ProcessVersion",
            Value::Text(env!("CARGO_PKG_VERSION").into()),
        );
        state.add_static("/Mgmt/Connection", Value::Text(CONNECTION.into()));

        state.add_static(
            "/DeviceInstance",
            Value::Int(identity.service.device_instance.into()),
        );
        state.add_static(
            "/ProductId",
            Value::Int(identity.service.product_id.into()),
        );
        state.add_static("/DeviceType", Value::Int(DEVICE_TYPE));
        state.add_static("/ProductName", Value::Text(PRODUCT_NAME.into()));
        state.add_static("/CustomName", Value::Text(identity.custom_name.clone()));
        state.add_static("/Latency", Value::Empty);
        state.add_static("/FirmwareVersion", Value::Float(0.1));
        state.add_static("/HardwareVersion", Value::Int(0));
        state.add_static("/Connected", Value::Int(1));
        state.add_static("/Role", Value::Text(identity.service.role.to_string()));
        state.add_static("/Position", Value::Int(identity.position.into()));
        state.add_static("/Serial", Value::Text(identity.serial.clone()));
        state.add_static(UPDATE_INDEX, Value::Int(0));

        let measurement_paths = state.paths.with_units().map(|(p, u)| (p.to_string(), u));
        for (path, unit) in measurement_paths {
            state.items.insert(
                path,
                Item {
                    value: Value::Int(0),
                    unit: Some(unit),
                    writeable: true,
                },
            );
        }
        state
    }

    fn add_static(&mut self, path: &str, value: Value) {
        self.items.insert(
            path.to_string(),
            Item {
                value,
                unit: None,
                writeable: false,
            },
        );
    }

    pub fn paths(&self) -> &MeterPaths {
        &self.paths
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.items.get(path).map(|item| &item.value)
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(Value::as_f64)
    }

    /// Human readable form, with unit suffix for measurement paths.
    pub fn text(&self, path: &str) -> Option<String> {
        let item = self.items.get(path)?;
        Some(match (item.unit, item.value.as_f64()) {
            (Some(unit), Some(value)) => unit.format(value),
            _ => item.value.to_string(),
        })
    }

    /// Handles a write coming from outside the process. Measurement paths
    /// accept anything; identity paths and unknown paths are refused.
    pub fn set(&mut self, path: &str, value: Value) -> WriteOutcome {
        match self.items.get_mut(path) {
            Some(item) if item.writeable => {
                debug!("someone else updated {path} to {value}");
                item.value = value;
                WriteOutcome::Accepted
            }
            Some(_) => {
                debug!("rejected write of {value} to read-only {path}");
                WriteOutcome::Rejected
            }
            None => WriteOutcome::Rejected,
        }
    }

    pub fn update_index(&self) -> u8 {
        match self.get(UPDATE_INDEX) {
            Some(Value::Int(v)) => *v as u8,
            _ => 0,
        }
    }

    /// Signals consumers that a cycle completed. Wraps at 256.
    pub fn bump_update_index(&mut self) -> u8 {
        let next = self.update_index().wrapping_add(1);
        self.put(UPDATE_INDEX, Value::Int(next.into()));
        next
    }

    pub fn publish(&mut self, m: &Measurements) {
        let paths = self.paths.clone();
        self.put(&paths.line_voltage, Value::Float(m.voltage));
        self.put(&paths.line_current, Value::Float(m.current));
        self.put(&paths.line_power, Value::Float(m.line_power));
        self.put(&paths.line_energy_forward, Value::Float(m.line_energy.forward));
        self.put(&paths.line_energy_reverse, Value::Float(m.line_energy.reverse));
        self.put(&paths.power, Value::Float(m.power));
        self.put(&paths.energy_forward, Value::Float(m.energy.forward));
        self.put(&paths.energy_reverse, Value::Float(m.energy.reverse));
    }

    /// Marks the instantaneous line reading as unavailable. Totals and the
    /// aggregate are left as they are.
    pub fn zero_line_power(&mut self) {
        let path = self.paths.line_power.clone();
        self.put(&path, Value::Int(0));
    }

    fn put(&mut self, path: &str, value: Value) {
        if let Some(item) = self.items.get_mut(path) {
            item.value = value;
        }
    }
}

/// Handle to the single published state, shared between the update cycle
/// and the Modbus surface.
#[derive(Debug, Clone)]
pub struct StateHandle(Arc<Mutex<PublishedState>>);

impl StateHandle {
    pub fn new(state: PublishedState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn lock(&self) -> MutexGuard<'_, PublishedState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
