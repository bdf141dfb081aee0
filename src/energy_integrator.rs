use std::time::Duration;

const SECONDS_PER_HOUR: f64 = 3600.0;
const WH_PER_KWH: f64 = 1000.0;

/// Forward (import) and reverse (export) energy counters in kWh.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyTotals {
    pub forward: f64,
    pub reverse: f64,
}

impl EnergyTotals {
    /// Counters as reported by the meter itself, which counts in Wh.
    pub fn from_wh(forward_wh: f64, reverse_wh: f64) -> Self {
        Self {
            forward: forward_wh / WH_PER_KWH,
            reverse: reverse_wh / WH_PER_KWH,
        }
    }

    /// Advances the counters assuming `power` (W) held for the whole
    /// `interval`. Import feeds `forward`, export feeds `reverse`.
    pub fn integrate(self, power: f64, interval: Duration) -> Self {
        let kwh = power.abs() * interval.as_secs_f64() / SECONDS_PER_HOUR / WH_PER_KWH;
        if power > 0.0 {
            Self {
                forward: self.forward + kwh,
                ..self
            }
        } else if power < 0.0 {
            Self {
                reverse: self.reverse + kwh,
                ..self
            }
        } else {
            self
        }
    }
}
