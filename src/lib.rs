//! Shelly Grid Meter Library
//!
//! Builds a virtual grid meter from a Shelly EM reading plus the power of an
//! EV charger and an inverter/charger published by other devices, and keeps
//! one consistent published state for consumers.

pub mod auxiliary_reader;
pub mod config;
pub mod energy_integrator;
pub mod meter_state;
pub mod modbus_server;
pub mod power_combiner;
pub mod property_bus;
pub mod shelly_em_client;
pub mod update_scheduler;

// Re-export commonly used types for easier access
pub use auxiliary_reader::{AuxiliaryPower, AuxiliaryReader};
pub use config::{Config, ConfigError, Role, ServiceIdentity};
pub use energy_integrator::EnergyTotals;
pub use meter_state::{DeviceIdentity, PublishedState, StateHandle, Value, WriteOutcome};
pub use property_bus::{HttpPropertyBus, PropertyBus};
pub use shelly_em_client::{MeterError, MeterReading, MeterSource, ShellyEmClient};
pub use update_scheduler::{CycleOutcome, UpdateScheduler};
