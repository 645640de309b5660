//! Simulated NR signal analyzer.
//!
//! Implements the driver traits without hardware. Every call lands in a
//! [`Journal`] so a run can be inspected afterwards, and faults or stuck
//! acquisitions can be injected through [`SimBehavior`].

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::nrmx::{
    AcpCarrierResults, AcpOffsetResults, Averaging, ChpResults, DigitalEdgeTrigger,
    DownlinkMaskType, Driver, Error, FrequencyRange, GNodeBCategory, Instrument, LinkDirection,
    Measurement, MeasurementInterval, MeasurementTypes, ModAccResults, ObwResults,
    SemCarrierResults, SemOffsetMargin, SemStatus, SignalConfiguration, SweepTime,
    UplinkMaskType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    OpenSession,
    ConfigureFrequencyReference,
    SignalConfiguration,
    SelectedPorts,
    ConfigureRf,
    DigitalEdgeTrigger,
    LinkDirection,
    FrequencyRange,
    Band,
    ComponentCarrierBandwidth,
    SubcarrierSpacing,
    SelectMeasurements(MeasurementTypes),
    SweepTime(Measurement),
    Averaging(Measurement),
    MeasurementInterval,
    UplinkMaskType,
    GNodeBCategory,
    DownlinkMaskType,
    DeltaFMaximum,
    RatedOutputPower,
    Commit,
    Initiate,
    WaitForMeasurementComplete,
    Fetch(Measurement),
    Dispose,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// `None` for session-level calls.
    pub signal: Option<String>,
    pub op: Op,
}

#[derive(Debug)]
struct JournalState {
    calls: Vec<Call>,
    occurrences: HashMap<Op, usize>,
    recording: bool,
}

/// Record of every call made into the simulator.
///
/// Per-op counts are always kept. The ordered call log is only kept while
/// recording, which is the default.
#[derive(Debug, Clone)]
pub struct Journal(Arc<Mutex<JournalState>>);

impl Default for Journal {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Journal {
    pub fn new(recording: bool) -> Self {
        Self(Arc::new(Mutex::new(JournalState {
            calls: Vec::new(),
            occurrences: HashMap::new(),
            recording,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, JournalState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a call and returns how many times `op` has now been seen.
    fn push(&self, call: Call) -> usize {
        let mut state = self.lock();
        let occurrence = state.occurrences.entry(call.op).or_default();
        *occurrence += 1;
        let occurrence = *occurrence;
        if state.recording {
            state.calls.push(call);
        }
        occurrence
    }

    pub fn is_recording(&self) -> bool {
        self.lock().recording
    }

    /// Recorded calls in order. Empty when recording is off.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.lock().occurrences.get(&op).copied().unwrap_or(0)
    }

    pub fn count_on(&self, signal: &str, op: Op) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op && c.signal.as_deref() == Some(signal))
            .count()
    }

    pub fn ops_on(&self, signal: &str) -> Vec<Op> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.signal.as_deref() == Some(signal))
            .map(|c| c.op)
            .collect()
    }
}

/// Fails the `occurrence`-th call (1-based) of `op` with an instrument fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub op: Op,
    pub occurrence: usize,
}

#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// Time from initiate until results are available.
    pub acquisition_time: Duration,
    pub seed: u64,
    /// Acquisitions never complete; every wait and fetch times out.
    pub hang_acquisitions: bool,
    pub faults: Vec<Fault>,
    pub acp_offsets: usize,
    pub sem_segments: usize,
    /// Added to every SEM margin, in dB. Positive values push segments into failure.
    pub sem_margin_offset: f64,
    /// Resource names that can be opened. `None` accepts any non-empty name.
    pub resources: Option<Vec<String>>,
    /// Keep the ordered call log. Off for long runs; counts are kept either way.
    pub record_calls: bool,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            acquisition_time: Duration::from_millis(5),
            seed: 0,
            hang_acquisitions: false,
            faults: Vec::new(),
            acp_offsets: 2,
            sem_segments: 4,
            sem_margin_offset: 0.0,
            resources: None,
            record_calls: true,
        }
    }
}

struct Shared {
    behavior: SimBehavior,
    journal: Journal,
}

impl Shared {
    fn call(&self, signal: Option<&str>, op: Op) -> Result<(), Error> {
        let occurrence = self.journal.push(Call {
            signal: signal.map(str::to_string),
            op,
        });
        let faulted = self
            .behavior
            .faults
            .iter()
            .any(|fault| fault.op == op && fault.occurrence == occurrence);
        if faulted {
            return Err(Error::InstrumentFault(format!(
                "injected fault on {:?} (call {})",
                op, occurrence
            )));
        }
        Ok(())
    }
}

pub struct SimDriver {
    shared: Arc<Shared>,
}

impl SimDriver {
    pub fn new(behavior: SimBehavior) -> Self {
        let journal = Journal::new(behavior.record_calls);
        Self {
            shared: Arc::new(Shared { behavior, journal }),
        }
    }

    pub fn journal(&self) -> Journal {
        self.shared.journal.clone()
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new(SimBehavior::default())
    }
}

impl Driver for SimDriver {
    type Instrument = SimInstrument;

    fn open_session(&mut self, resource_name: &str) -> Result<SimInstrument, Error> {
        self.shared.call(None, Op::OpenSession)?;

        let known = match &self.shared.behavior.resources {
            Some(resources) => resources.iter().any(|r| r == resource_name),
            None => !resource_name.is_empty(),
        };
        if !known {
            return Err(Error::ResourceNotFound(resource_name.to_string()));
        }

        log::debug!("simulated session opened on {}", resource_name);
        Ok(SimInstrument {
            shared: self.shared.clone(),
            open: Arc::new(AtomicBool::new(true)),
            signals: HashMap::new(),
        })
    }
}

pub struct SimInstrument {
    shared: Arc<Shared>,
    open: Arc<AtomicBool>,
    signals: HashMap<String, Arc<Mutex<SignalState>>>,
}

impl Instrument for SimInstrument {
    type Signal = SimSignal;

    fn configure_frequency_reference(&mut self, source: &str, frequency: f64) -> Result<(), Error> {
        self.shared.call(None, Op::ConfigureFrequencyReference)?;
        if !self.open.load(Ordering::Relaxed) {
            return Err(Error::SessionClosed);
        }
        if source.is_empty() || !(frequency > 0.0) {
            return Err(Error::ConfigurationRejected(format!(
                "frequency reference {:?} at {} Hz",
                source, frequency
            )));
        }
        Ok(())
    }

    fn signal_configuration(&mut self, name: &str) -> Result<SimSignal, Error> {
        self.shared.call(Some(name), Op::SignalConfiguration)?;
        if !self.open.load(Ordering::Relaxed) {
            return Err(Error::SessionClosed);
        }

        let seed = self.shared.behavior.seed.wrapping_add(self.signals.len() as u64);
        let state = self
            .signals
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SignalState::new(seed))))
            .clone();

        Ok(SimSignal {
            name: name.to_string(),
            shared: self.shared.clone(),
            session_open: self.open.clone(),
            state,
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        self.shared.call(None, Op::Close)?;
        self.open.store(false, Ordering::Relaxed);
        log::debug!("simulated session closed");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SimResults {
    modacc: ModAccResults,
    acp_carrier: AcpCarrierResults,
    acp_offsets: Vec<AcpOffsetResults>,
    chp: ChpResults,
    obw: ObwResults,
    sem_carrier: SemCarrierResults,
    sem_lower: Vec<SemOffsetMargin>,
    sem_upper: Vec<SemOffsetMargin>,
    sem_status: SemStatus,
}

struct Acquisition {
    started: Instant,
    results: SimResults,
}

struct SignalState {
    selected: MeasurementTypes,
    center_frequency: f64,
    reference_level: f64,
    direction: LinkDirection,
    frequency_range: FrequencyRange,
    bandwidth: f64,
    committed: bool,
    disposed: bool,
    acquisition: Option<Acquisition>,
    rng: StdRng,
}

impl SignalState {
    fn new(seed: u64) -> Self {
        Self {
            selected: MeasurementTypes::NONE,
            center_frequency: 1e9,
            reference_level: 0.0,
            direction: LinkDirection::Uplink,
            frequency_range: FrequencyRange::Range1,
            bandwidth: 20e6,
            committed: false,
            disposed: false,
            acquisition: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn generate(&mut self, behavior: &SimBehavior) -> SimResults {
        let rng = &mut self.rng;
        let mut jitter = |span: f64| rng.gen_range(-span..=span);

        // FR2 carriers come in a few dB lower than FR1 at the same reference level.
        let range_loss = match self.frequency_range {
            FrequencyRange::Range1 => 0.0,
            FrequencyRange::Range2 => 3.0,
        };
        let power = self.reference_level - 12.0 - range_loss + jitter(0.3);
        let center = self.center_frequency;
        let bandwidth = self.bandwidth;

        let rms_evm = 0.8 + jitter(0.1);
        let modacc = ModAccResults {
            composite_rms_evm_mean: rms_evm,
            composite_peak_evm_maximum: rms_evm * 3.5 + jitter(0.2),
            frequency_error_mean: jitter(50.0),
            iq_origin_offset_mean: -55.0 + jitter(2.0),
        };

        let acp_offsets = (0..behavior.acp_offsets)
            .map(|i| {
                let lower = -(45.0 + 5.0 * i as f64) + jitter(1.0);
                let upper = -(45.0 + 5.0 * i as f64) + jitter(1.0);
                AcpOffsetResults {
                    lower_relative_power: lower,
                    upper_relative_power: upper,
                    lower_absolute_power: power + lower,
                    upper_absolute_power: power + upper,
                }
            })
            .collect();

        let occupied = bandwidth * (0.97 + jitter(0.005));
        let obw = ObwResults {
            occupied_bandwidth: occupied,
            absolute_power: power + jitter(0.05),
            start_frequency: center - occupied / 2.0,
            stop_frequency: center + occupied / 2.0,
        };

        let step = bandwidth * 0.1;
        let segment = |i: usize, sign: f64, jitter: &mut dyn FnMut(f64) -> f64| {
            let margin = -(15.0 + 3.0 * i as f64) + jitter(2.0) + behavior.sem_margin_offset;
            let absolute = power - 30.0 - 5.0 * i as f64 + jitter(1.0);
            SemOffsetMargin {
                status: if margin <= 0.0 {
                    SemStatus::Pass
                } else {
                    SemStatus::Fail
                },
                margin,
                margin_frequency: center + sign * (bandwidth / 2.0 + step * (i + 1) as f64),
                margin_absolute_power: absolute,
                margin_relative_power: absolute - power,
            }
        };
        let sem_lower: Vec<_> = (0..behavior.sem_segments)
            .map(|i| segment(i, -1.0, &mut jitter))
            .collect();
        let sem_upper: Vec<_> = (0..behavior.sem_segments)
            .map(|i| segment(i, 1.0, &mut jitter))
            .collect();
        let sem_status = if sem_lower
            .iter()
            .chain(sem_upper.iter())
            .all(|s| s.status == SemStatus::Pass)
        {
            SemStatus::Pass
        } else {
            SemStatus::Fail
        };

        SimResults {
            modacc,
            acp_carrier: AcpCarrierResults {
                absolute_power: power,
                relative_power: 0.0,
            },
            acp_offsets,
            chp: ChpResults {
                absolute_power: power,
                relative_power: 0.0,
            },
            obw,
            sem_carrier: SemCarrierResults {
                absolute_integrated_power: power,
                peak_absolute_integrated_power: power + 3.0 + jitter(0.5),
                peak_frequency: center + jitter(bandwidth * 0.1),
                relative_integrated_power: 0.0,
            },
            sem_lower,
            sem_upper,
            sem_status,
        }
    }
}

pub struct SimSignal {
    name: String,
    shared: Arc<Shared>,
    session_open: Arc<AtomicBool>,
    state: Arc<Mutex<SignalState>>,
}

impl SimSignal {
    fn state(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the call and hands out the signal state if the handle is still usable.
    fn enter(&self, op: Op) -> Result<MutexGuard<'_, SignalState>, Error> {
        self.shared.call(Some(&self.name), op)?;
        if !self.session_open.load(Ordering::Relaxed) {
            return Err(Error::SessionClosed);
        }
        let state = self.state();
        if state.disposed {
            return Err(Error::ConfigurationRejected(format!(
                "{} has been disposed",
                self.name
            )));
        }
        Ok(state)
    }

    /// Same as `enter`, and marks the configuration as changed. Results of
    /// an earlier acquisition no longer apply.
    fn configure(&self, op: Op) -> Result<MutexGuard<'_, SignalState>, Error> {
        let mut state = self.enter(op)?;
        state.committed = false;
        state.acquisition = None;
        Ok(state)
    }

    fn require_selected(&self, state: &SignalState, measurement: Measurement) -> Result<(), Error> {
        if !state.selected.contains(measurement) {
            return Err(Error::ConfigurationRejected(format!(
                "{} is not selected on {}",
                measurement, self.name
            )));
        }
        Ok(())
    }

    fn require_direction(
        &self,
        state: &SignalState,
        direction: LinkDirection,
        setting: &str,
    ) -> Result<(), Error> {
        if state.direction != direction {
            return Err(Error::ConfigurationRejected(format!(
                "{} only applies to {:?} on {}",
                setting, direction, self.name
            )));
        }
        Ok(())
    }

    fn sem_downlink(&self, op: Op, setting: &str) -> Result<(), Error> {
        let state = self.configure(op)?;
        self.require_selected(&state, Measurement::Sem)?;
        self.require_direction(&state, LinkDirection::Downlink, setting)
    }

    fn block_until_complete(&self, operation: &str, timeout: Duration) -> Result<(), Error> {
        let remaining = {
            let state = self.state();
            let acquisition = state
                .acquisition
                .as_ref()
                .ok_or_else(|| Error::NotInitiated(self.name.clone()))?;
            if self.shared.behavior.hang_acquisitions {
                None
            } else {
                Some(
                    self.shared
                        .behavior
                        .acquisition_time
                        .saturating_sub(acquisition.started.elapsed()),
                )
            }
        };

        match remaining {
            Some(remaining) if remaining <= timeout => {
                thread::sleep(remaining);
                Ok(())
            }
            _ => {
                thread::sleep(timeout);
                Err(Error::Timeout {
                    operation: format!("{} on {}", operation, self.name),
                    timeout,
                })
            }
        }
    }

    fn fetch<T>(
        &self,
        measurement: Measurement,
        timeout: Duration,
        pick: impl FnOnce(&SimResults) -> T,
    ) -> Result<T, Error> {
        {
            let state = self.enter(Op::Fetch(measurement))?;
            self.require_selected(&state, measurement)?;
        }
        self.block_until_complete(&format!("{} fetch", measurement), timeout)?;

        let state = self.state();
        let acquisition = state
            .acquisition
            .as_ref()
            .ok_or_else(|| Error::NotInitiated(self.name.clone()))?;
        Ok(pick(&acquisition.results))
    }
}

impl SignalConfiguration for SimSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_selected_ports(&mut self, ports: &str) -> Result<(), Error> {
        let _state = self.configure(Op::SelectedPorts)?;
        if ports.is_empty() {
            return Err(Error::ConfigurationRejected("empty port selection".to_string()));
        }
        Ok(())
    }

    fn configure_rf(
        &mut self,
        center_frequency: f64,
        reference_level: f64,
        _external_attenuation: f64,
    ) -> Result<(), Error> {
        let mut state = self.configure(Op::ConfigureRf)?;
        state.center_frequency = center_frequency;
        state.reference_level = reference_level;
        Ok(())
    }

    fn configure_digital_edge_trigger(&mut self, trigger: &DigitalEdgeTrigger) -> Result<(), Error> {
        let _state = self.configure(Op::DigitalEdgeTrigger)?;
        if trigger.enabled && trigger.source.is_empty() {
            return Err(Error::ConfigurationRejected(
                "trigger enabled without a source".to_string(),
            ));
        }
        Ok(())
    }

    fn set_link_direction(&mut self, direction: LinkDirection) -> Result<(), Error> {
        self.configure(Op::LinkDirection)?.direction = direction;
        Ok(())
    }

    fn set_frequency_range(&mut self, range: FrequencyRange) -> Result<(), Error> {
        self.configure(Op::FrequencyRange)?.frequency_range = range;
        Ok(())
    }

    fn set_band(&mut self, _band: u32) -> Result<(), Error> {
        let _state = self.configure(Op::Band)?;
        Ok(())
    }

    fn set_component_carrier_bandwidth(&mut self, bandwidth: f64) -> Result<(), Error> {
        self.configure(Op::ComponentCarrierBandwidth)?.bandwidth = bandwidth;
        Ok(())
    }

    fn set_subcarrier_spacing(&mut self, _spacing: f64) -> Result<(), Error> {
        let _state = self.configure(Op::SubcarrierSpacing)?;
        Ok(())
    }

    fn select_measurements(&mut self, measurements: MeasurementTypes, _enable_traces: bool) -> Result<(), Error> {
        self.configure(Op::SelectMeasurements(measurements))?.selected = measurements;
        Ok(())
    }

    fn configure_sweep_time(&mut self, measurement: Measurement, _sweep_time: SweepTime) -> Result<(), Error> {
        let state = self.configure(Op::SweepTime(measurement))?;
        if measurement == Measurement::ModAcc {
            return Err(Error::ConfigurationRejected(
                "ModAcc has no sweep time".to_string(),
            ));
        }
        self.require_selected(&state, measurement)
    }

    fn configure_averaging(&mut self, measurement: Measurement, averaging: Averaging) -> Result<(), Error> {
        let state = self.configure(Op::Averaging(measurement))?;
        if averaging.count == 0 {
            return Err(Error::ConfigurationRejected(
                "averaging count must be at least 1".to_string(),
            ));
        }
        self.require_selected(&state, measurement)
    }

    fn configure_modacc_measurement_interval(&mut self, _interval: MeasurementInterval) -> Result<(), Error> {
        let state = self.configure(Op::MeasurementInterval)?;
        self.require_selected(&state, Measurement::ModAcc)
    }

    fn configure_uplink_mask_type(&mut self, _mask: UplinkMaskType) -> Result<(), Error> {
        let state = self.configure(Op::UplinkMaskType)?;
        self.require_selected(&state, Measurement::Sem)?;
        self.require_direction(&state, LinkDirection::Uplink, "uplink mask type")
    }

    fn configure_gnodeb_category(&mut self, _category: GNodeBCategory) -> Result<(), Error> {
        let state = self.configure(Op::GNodeBCategory)?;
        self.require_direction(&state, LinkDirection::Downlink, "gNodeB category")
    }

    fn set_downlink_mask_type(&mut self, _mask: DownlinkMaskType) -> Result<(), Error> {
        self.sem_downlink(Op::DownlinkMaskType, "downlink mask type")
    }

    fn set_delta_f_maximum(&mut self, _delta_f_maximum: f64) -> Result<(), Error> {
        self.sem_downlink(Op::DeltaFMaximum, "delta F max")
    }

    fn configure_rated_output_power(&mut self, _power: f64) -> Result<(), Error> {
        self.sem_downlink(Op::RatedOutputPower, "rated output power")
    }

    fn commit(&mut self) -> Result<(), Error> {
        let mut state = self.enter(Op::Commit)?;
        if state.selected.is_empty() {
            return Err(Error::ConfigurationRejected(format!(
                "no measurements selected on {}",
                self.name
            )));
        }
        state.committed = true;
        state.acquisition = None;
        Ok(())
    }

    fn initiate(&mut self) -> Result<(), Error> {
        let mut state = self.enter(Op::Initiate)?;
        if state.selected.is_empty() {
            return Err(Error::ConfigurationRejected(format!(
                "no measurements selected on {}",
                self.name
            )));
        }
        if !state.committed {
            log::debug!("{} initiated without commit, committing implicitly", self.name);
            state.committed = true;
        }
        let results = state.generate(&self.shared.behavior);
        state.acquisition = Some(Acquisition {
            started: Instant::now(),
            results,
        });
        Ok(())
    }

    fn wait_for_measurement_complete(&mut self, timeout: Duration) -> Result<(), Error> {
        drop(self.enter(Op::WaitForMeasurementComplete)?);
        self.block_until_complete("wait for measurement complete", timeout)
    }

    fn fetch_modacc(&mut self, timeout: Duration) -> Result<ModAccResults, Error> {
        self.fetch(Measurement::ModAcc, timeout, |r| r.modacc)
    }

    fn fetch_acp_offsets(&mut self, timeout: Duration) -> Result<Vec<AcpOffsetResults>, Error> {
        self.fetch(Measurement::Acp, timeout, |r| r.acp_offsets.clone())
    }

    fn fetch_acp_carrier(&mut self, timeout: Duration) -> Result<AcpCarrierResults, Error> {
        self.fetch(Measurement::Acp, timeout, |r| r.acp_carrier)
    }

    fn fetch_chp(&mut self, timeout: Duration) -> Result<ChpResults, Error> {
        self.fetch(Measurement::Chp, timeout, |r| r.chp)
    }

    fn fetch_obw(&mut self, timeout: Duration) -> Result<ObwResults, Error> {
        self.fetch(Measurement::Obw, timeout, |r| r.obw)
    }

    fn fetch_sem_lower_offsets(&mut self, timeout: Duration) -> Result<Vec<SemOffsetMargin>, Error> {
        self.fetch(Measurement::Sem, timeout, |r| r.sem_lower.clone())
    }

    fn fetch_sem_upper_offsets(&mut self, timeout: Duration) -> Result<Vec<SemOffsetMargin>, Error> {
        self.fetch(Measurement::Sem, timeout, |r| r.sem_upper.clone())
    }

    fn fetch_sem_carrier(&mut self, timeout: Duration) -> Result<SemCarrierResults, Error> {
        self.fetch(Measurement::Sem, timeout, |r| r.sem_carrier)
    }

    fn fetch_sem_status(&mut self, timeout: Duration) -> Result<SemStatus, Error> {
        self.fetch(Measurement::Sem, timeout, |r| r.sem_status)
    }

    fn dispose(&mut self) -> Result<(), Error> {
        self.shared.call(Some(&self.name), Op::Dispose)?;
        self.state().disposed = true;
        Ok(())
    }
}
