use crate::auxiliary_reader::AuxiliaryReader;
use crate::config::UPDATE_INTERVAL;
use crate::energy_integrator::EnergyTotals;
use crate::meter_state::{Measurements, StateHandle};
use crate::power_combiner::combine;
use crate::property_bus::PropertyBus;
use crate::shelly_em_client::{MeterError, MeterSource};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("error getting data from Shelly: {0}")]
    Fetch(#[from] MeterError),
    #[error("unexpected failure while {phase:?}: {reason}")]
    Unexpected { phase: CyclePhase, reason: String },
}

/// Where the update cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Combining,
    Integrating,
    Publishing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Fresh measurements were published.
    Updated,
    /// The meter could not be read; line power was zeroed.
    Degraded,
    /// Something else went wrong; nothing but the update index changed.
    Failed,
}

/// Drives the update cycle and the liveness report on one task.
pub struct UpdateScheduler<M, B> {
    meter: M,
    auxiliary: AuxiliaryReader<B>,
    state: StateHandle,
    totals: EnergyTotals,
    interval: Duration,
    sign_of_life: Option<Duration>,
    phase: CyclePhase,
    last_update: Option<DateTime<Utc>>,
}

impl<M: MeterSource, B: PropertyBus> UpdateScheduler<M, B> {
    pub fn new(
        meter: M,
        auxiliary: AuxiliaryReader<B>,
        state: StateHandle,
        sign_of_life: Option<Duration>,
    ) -> Self {
        Self {
            meter,
            auxiliary,
            state,
            totals: EnergyTotals::default(),
            interval: UPDATE_INTERVAL,
            sign_of_life,
            phase: CyclePhase::Idle,
            last_update: None,
        }
    }

    /// Overrides the update period. Integration follows the same value.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    /// Aggregate running totals, independent of what is currently published.
    pub fn totals(&self) -> EnergyTotals {
        self.totals
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Runs one complete cycle. Never fails: every outcome ends with a bumped
    /// update index so consumers keep seeing a heartbeat.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let outcome = match self.try_cycle().await {
            Ok(()) => CycleOutcome::Updated,
            Err(CycleError::Fetch(e)) => {
                error!(
                    critical = true,
                    "Error getting data from Shelly - check network or Shelly status. Setting power values to 0. Details: {e}"
                );
                self.phase = CyclePhase::Publishing;
                self.state.lock().zero_line_power();
                CycleOutcome::Degraded
            }
            Err(e) => {
                error!(critical = true, "update cycle failed: {e}");
                CycleOutcome::Failed
            }
        };
        let index = self.state.lock().bump_update_index();
        self.phase = CyclePhase::Idle;
        debug!(index, ?outcome, "cycle complete");
        outcome
    }

    async fn try_cycle(&mut self) -> Result<(), CycleError> {
        self.phase = CyclePhase::Fetching;
        let reading = self.meter.fetch().await?;

        self.phase = CyclePhase::Combining;
        let auxiliary = self.auxiliary.collect().await;
        let power = combine(reading.power, &auxiliary);
        debug!(
            meter = reading.power,
            ev_charger = auxiliary.ev_charger,
            inverter = auxiliary.inverter,
            "combined power {power}W"
        );

        self.phase = CyclePhase::Integrating;
        let totals = self.totals.integrate(power, self.interval);
        let measurements = Measurements {
            voltage: reading.voltage,
            current: reading.current(),
            line_power: power,
            line_energy: EnergyTotals::from_wh(reading.forward_wh, reading.reverse_wh),
            power,
            energy: totals,
        };
        if !measurements.is_finite() {
            return Err(CycleError::Unexpected {
                phase: self.phase,
                reason: format!("non-finite values in {measurements:?}"),
            });
        }

        self.phase = CyclePhase::Publishing;
        self.state.lock().publish(&measurements);
        self.totals = totals;
        self.last_update = Some(Utc::now());
        debug!(
            power,
            forward = totals.forward,
            reverse = totals.reverse,
            "house consumption"
        );
        Ok(())
    }

    /// Logs the current state. Reads only.
    pub fn sign_of_life(&self) {
        let last_update = self
            .last_update
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".into());
        let state = self.state.lock();
        let power = state
            .text(&state.paths().power)
            .unwrap_or_else(|| "---".into());
        info!("--- Start: sign of life ---");
        info!("Last update: {last_update}");
        info!("Last '/Ac/Power': {power}");
        info!("--- End: sign of life ---");
    }

    /// Runs forever. Cycles never overlap; a slow cycle delays the next tick
    /// instead of queueing extra ones.
    pub async fn run(mut self) {
        let mut update = time::interval(self.interval);
        update.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness = self.sign_of_life.map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(interval = ?self.interval, "starting update loop");
        loop {
            tokio::select! {
                _ = update.tick() => {
                    self.run_cycle().await;
                }
                _ = tick_if_enabled(&mut liveness) => {
                    self.sign_of_life();
                }
            }
        }
    }
}

async fn tick_if_enabled(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
