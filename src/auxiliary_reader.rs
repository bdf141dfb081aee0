use crate::config::{AuxiliaryConfig, BusSource};
use crate::property_bus::PropertyBus;
use tracing::debug;

/// Contributions of the auxiliary devices for one cycle, in W.
/// Unavailable sources are already folded to 0.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AuxiliaryPower {
    pub ev_charger: f64,
    pub inverter: f64,
}

impl AuxiliaryPower {
    pub fn total(&self) -> f64 {
        self.ev_charger + self.inverter
    }
}

/// Best-effort reader for the EV charger and inverter/charger powers.
pub struct AuxiliaryReader<B> {
    bus: B,
    ev_charger: BusSource,
    inverter: BusSource,
    consider_inverter: bool,
}

impl<B: PropertyBus> AuxiliaryReader<B> {
    pub fn new(bus: B, config: &AuxiliaryConfig) -> Self {
        Self {
            bus,
            ev_charger: config.ev_charger.clone(),
            inverter: config.inverter.clone(),
            consider_inverter: config.consider_inverter,
        }
    }

    pub async fn collect(&self) -> AuxiliaryPower {
        let ev_charger = self.read_or_zero(&self.ev_charger).await;
        let inverter = if self.consider_inverter {
            self.read_or_zero(&self.inverter).await
        } else {
            debug!("inverter power not considered");
            0.0
        };
        AuxiliaryPower {
            ev_charger,
            inverter,
        }
    }

    async fn read_or_zero(&self, source: &BusSource) -> f64 {
        match self.bus.read_value(&source.service, &source.path).await {
            Ok(Some(value)) if value.is_finite() => value,
            Ok(_) => {
                debug!(service = %source.service, path = %source.path, "no value, using 0W");
                0.0
            }
            Err(e) => {
                debug!(service = %source.service, path = %source.path, "unavailable, using 0W: {e}");
                0.0
            }
        }
    }
}
