//! Pipelined ModAcc/ACP/CHP/OBW/SEM measurement loop.
//!
//! Two signal configurations share one session: "carrier" runs ModAcc, CHP
//! and OBW, "offsets" runs ACP and SEM. The offsets acquisition starts once
//! the carrier acquisition is done, and overlaps the first carrier fetches.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    config::MeasurementConfig,
    nrmx::{
        AcpCarrierResults, AcpOffsetResults, ChpResults, Driver, Error, Instrument, LinkDirection,
        Measurement, MeasurementTypes, ModAccResults, ObwResults, SemCarrierResults,
        SemOffsetMargin, SemStatus, SignalConfiguration,
    },
    timing::TimingSeries,
};

pub const OFFSETS_SIGNAL: &str = "signal::offsets";
pub const CARRIER_SIGNAL: &str = "signal::carrier";

pub fn offsets_measurements() -> MeasurementTypes {
    Measurement::Acp | Measurement::Sem
}

pub fn carrier_measurements() -> MeasurementTypes {
    Measurement::ModAcc | Measurement::Chp | Measurement::Obw
}

/// Open instrument session, closed when dropped.
pub struct Session<I: Instrument> {
    instrument: Option<I>,
}

impl<I: Instrument> Session<I> {
    pub fn new(instrument: I) -> Self {
        Self {
            instrument: Some(instrument),
        }
    }

    pub fn instrument(&mut self) -> Result<&mut I, Error> {
        self.instrument.as_mut().ok_or(Error::SessionClosed)
    }

    /// Closes the session. Later calls do nothing.
    pub fn close(&mut self) -> Result<(), Error> {
        match self.instrument.take() {
            Some(mut instrument) => instrument.close(),
            None => Ok(()),
        }
    }
}

impl<I: Instrument> Drop for Session<I> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("failed to close session: {}", err);
        }
    }
}

/// Signal configuration handle, disposed when dropped.
pub struct SignalHandle<S: SignalConfiguration> {
    signal: Option<S>,
}

impl<S: SignalConfiguration> SignalHandle<S> {
    pub fn new(signal: S) -> Self {
        Self {
            signal: Some(signal),
        }
    }

    pub fn get(&mut self) -> Result<&mut S, Error> {
        self.signal.as_mut().ok_or(Error::SessionClosed)
    }

    /// Disposes the signal. Later calls do nothing.
    pub fn dispose(&mut self) -> Result<(), Error> {
        match self.signal.take() {
            Some(mut signal) => signal.dispose(),
            None => Ok(()),
        }
    }
}

impl<S: SignalConfiguration> Drop for SignalHandle<S> {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            log::warn!("failed to dispose signal configuration: {}", err);
        }
    }
}

/// Results of the most recent cycle. Every field is overwritten by each fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSnapshot {
    pub modacc: ModAccResults,
    pub chp: ChpResults,
    pub acp_carrier: AcpCarrierResults,
    pub acp_offsets: Vec<AcpOffsetResults>,
    pub obw: ObwResults,
    pub sem_status: SemStatus,
    pub sem_carrier: SemCarrierResults,
    pub sem_lower_offsets: Vec<SemOffsetMargin>,
    pub sem_upper_offsets: Vec<SemOffsetMargin>,
}

/// Shared with whoever watches or stops the run.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub completed: Arc<AtomicU64>,
    pub last_cycle_micros: Arc<AtomicU64>,
    pub stop: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub timings: TimingSeries,
    pub results: ResultSnapshot,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub result: Result<RunSummary, Error>,
    pub teardown_errors: Vec<Error>,
}

type Signal<D> = <<D as Driver>::Instrument as Instrument>::Signal;

pub struct Orchestrator<D: Driver> {
    config: MeasurementConfig,
    // Released in this order: signals before the session that owns them.
    offsets: Option<SignalHandle<Signal<D>>>,
    carrier: Option<SignalHandle<Signal<D>>>,
    session: Option<Session<D::Instrument>>,
    driver: D,
}

impl<D: Driver> Orchestrator<D> {
    pub fn new(config: MeasurementConfig, driver: D) -> Self {
        Self {
            config,
            offsets: None,
            carrier: None,
            session: None,
            driver,
        }
    }

    pub fn config(&self) -> &MeasurementConfig {
        &self.config
    }

    /// Runs every iteration, then releases the instrument whatever happened.
    pub fn execute(mut self, control: &RunControl) -> RunOutcome {
        let result = self.run(control);
        if let Err(err) = &result {
            log::error!("measurement run aborted: {}", err);
        }
        let teardown_errors = self.teardown();
        RunOutcome {
            result,
            teardown_errors,
        }
    }

    pub fn run(&mut self, control: &RunControl) -> Result<RunSummary, Error> {
        self.setup()?;

        let iterations = self.config.iterations;
        let mut timings = TimingSeries::with_capacity(iterations);
        let mut results = ResultSnapshot::default();

        for iteration in 0..iterations {
            if control.stop.load(Ordering::Relaxed) {
                log::info!("stop requested after {} iterations", iteration);
                return Err(Error::Interrupted);
            }

            let elapsed = self.cycle(&mut results)?;
            timings.record(elapsed);

            control
                .last_cycle_micros
                .store(elapsed.as_micros() as u64, Ordering::Relaxed);
            control.completed.fetch_add(1, Ordering::Relaxed);
            log::debug!("iteration {} took {:?}", iteration, elapsed);
        }

        Ok(RunSummary { timings, results })
    }

    pub fn setup(&mut self) -> Result<(), Error> {
        if self.session.is_some() {
            return Ok(());
        }
        self.config
            .validate()
            .map_err(|err| Error::ConfigurationRejected(err.to_string()))?;
        log::info!("opening session on {}", self.config.resource_name);
        let instrument = self.driver.open_session(&self.config.resource_name)?;
        self.session = Some(Session::new(instrument));
        Ok(())
    }

    /// One configure, initiate, fetch pass. Returns its wall-clock duration.
    pub fn cycle(&mut self, results: &mut ResultSnapshot) -> Result<Duration, Error> {
        let start = Instant::now();

        self.configure()?;
        let configured = start.elapsed();

        self.initiate()?;
        let acquired = start.elapsed();

        self.fetch(results)?;
        let elapsed = start.elapsed();

        log::debug!(
            "configure {:?}, acquire {:?}, fetch {:?}",
            configured,
            acquired - configured,
            elapsed - acquired
        );
        Ok(elapsed)
    }

    fn configure(&mut self) -> Result<(), Error> {
        let config = &self.config;
        let instrument = self
            .session
            .as_mut()
            .ok_or(Error::SessionClosed)?
            .instrument()?;

        instrument.configure_frequency_reference(
            &config.frequency_reference.source,
            config.frequency_reference.frequency,
        )?;

        if self.offsets.is_none() {
            self.offsets = Some(SignalHandle::new(
                instrument.signal_configuration(OFFSETS_SIGNAL)?,
            ));
        }
        if self.carrier.is_none() {
            self.carrier = Some(SignalHandle::new(
                instrument.signal_configuration(CARRIER_SIGNAL)?,
            ));
        }
        let offsets = signal(&mut self.offsets)?;
        let carrier = signal(&mut self.carrier)?;

        apply_shared_settings(offsets, config, offsets_measurements())?;
        apply_shared_settings(carrier, config, carrier_measurements())?;

        apply_measurement_settings(offsets, config, offsets_measurements())?;
        apply_measurement_settings(carrier, config, carrier_measurements())?;

        carrier.configure_modacc_measurement_interval(config.measurement_interval())?;

        apply_mask_settings(offsets, config)?;

        offsets.commit()?;
        carrier.commit()?;
        Ok(())
    }

    fn initiate(&mut self) -> Result<(), Error> {
        let timeout = self.config.timeout;
        let offsets = signal(&mut self.offsets)?;
        let carrier = signal(&mut self.carrier)?;

        carrier.initiate()?;
        carrier.wait_for_measurement_complete(timeout)?;
        offsets.initiate()?;
        Ok(())
    }

    fn fetch(&mut self, results: &mut ResultSnapshot) -> Result<(), Error> {
        let timeout = self.config.timeout;
        let offsets = signal(&mut self.offsets)?;
        let carrier = signal(&mut self.carrier)?;

        // Carrier results are ready; read them while offsets is still acquiring.
        results.modacc = carrier.fetch_modacc(timeout)?;
        results.chp = carrier.fetch_chp(timeout)?;
        results.obw = carrier.fetch_obw(timeout)?;

        offsets.wait_for_measurement_complete(timeout)?;

        results.acp_offsets = offsets.fetch_acp_offsets(timeout)?;
        results.acp_carrier = offsets.fetch_acp_carrier(timeout)?;
        results.sem_lower_offsets = offsets.fetch_sem_lower_offsets(timeout)?;
        results.sem_upper_offsets = offsets.fetch_sem_upper_offsets(timeout)?;
        results.sem_carrier = offsets.fetch_sem_carrier(timeout)?;
        results.sem_status = offsets.fetch_sem_status(timeout)?;
        Ok(())
    }

    /// Releases both signals, then the session. Safe to call at any point and
    /// more than once; failures are logged and returned, never raised.
    pub fn teardown(&mut self) -> Vec<Error> {
        let mut errors = Vec::new();

        for (name, handle) in [
            (OFFSETS_SIGNAL, self.offsets.take()),
            (CARRIER_SIGNAL, self.carrier.take()),
        ] {
            if let Some(mut handle) = handle {
                if let Err(err) = handle.dispose() {
                    log::warn!("failed to dispose {}: {}", name, err);
                    errors.push(err);
                }
            }
        }

        if let Some(mut session) = self.session.take() {
            match session.close() {
                Ok(()) => log::info!("session closed"),
                Err(err) => {
                    log::warn!("failed to close session: {}", err);
                    errors.push(err);
                }
            }
        }

        errors
    }
}

impl<D: Driver> Drop for Orchestrator<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn signal<S: SignalConfiguration>(handle: &mut Option<SignalHandle<S>>) -> Result<&mut S, Error> {
    handle.as_mut().ok_or(Error::SessionClosed)?.get()
}

fn apply_shared_settings<S: SignalConfiguration>(
    signal: &mut S,
    config: &MeasurementConfig,
    measurements: MeasurementTypes,
) -> Result<(), Error> {
    signal.set_selected_ports(&config.rf.selected_ports)?;
    signal.configure_rf(
        config.rf.center_frequency,
        config.rf.reference_level,
        config.rf.external_attenuation,
    )?;
    signal.configure_digital_edge_trigger(&config.trigger())?;

    signal.set_link_direction(config.carrier.link_direction)?;
    signal.set_frequency_range(config.carrier.frequency_range)?;
    signal.set_band(config.carrier.band)?;
    signal.set_component_carrier_bandwidth(config.carrier.bandwidth)?;
    signal.set_subcarrier_spacing(config.carrier.subcarrier_spacing)?;

    signal.select_measurements(measurements, true)
}

/// Sweep time for every swept measurement, averaging for all of them.
fn apply_measurement_settings<S: SignalConfiguration>(
    signal: &mut S,
    config: &MeasurementConfig,
    measurements: MeasurementTypes,
) -> Result<(), Error> {
    for measurement in measurements.iter() {
        if measurement != Measurement::ModAcc {
            signal.configure_sweep_time(measurement, config.sweep_time())?;
        }
    }
    for measurement in measurements.iter() {
        signal.configure_averaging(measurement, config.averaging())?;
    }
    Ok(())
}

fn apply_mask_settings<S: SignalConfiguration>(
    signal: &mut S,
    config: &MeasurementConfig,
) -> Result<(), Error> {
    match config.carrier.link_direction {
        LinkDirection::Uplink => signal.configure_uplink_mask_type(config.sem.uplink_mask_type),
        LinkDirection::Downlink => {
            signal.configure_gnodeb_category(config.sem.gnodeb_category)?;
            signal.set_downlink_mask_type(config.sem.downlink_mask_type)?;
            signal.set_delta_f_maximum(config.sem.delta_f_maximum)?;
            signal.configure_rated_output_power(config.sem.rated_output_power)
        }
    }
}
