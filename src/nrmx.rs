//! Boundary to the NR signal analyzer driver.
//!
//! The analyzer does all acquisition and measurement math. This module only
//! describes what we push into it and what we pull back out.

use std::{fmt, ops::BitOr, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{operation} did not complete within {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("configuration rejected: {0}")]
    ConfigurationRejected(String),

    #[error("no acquisition initiated on {0}")]
    NotInitiated(String),

    #[error("instrument resource not found: {0}")]
    ResourceNotFound(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("instrument fault: {0}")]
    InstrumentFault(String),

    #[error("interrupted by user")]
    Interrupted,
}

impl Error {
    /// Stable name of the error category, printed in front of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Timeout { .. } => "Timeout",
            Error::ConfigurationRejected(_) => "ConfigurationRejected",
            Error::NotInitiated(_) => "NotInitiated",
            Error::ResourceNotFound(_) => "ResourceNotFound",
            Error::SessionClosed => "SessionClosed",
            Error::InstrumentFault(_) => "InstrumentFault",
            Error::Interrupted => "Interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDirection {
    Uplink,
    Downlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyRange {
    Range1,
    Range2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitalEdge {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementLengthUnit {
    Slot,
    Subframe,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UplinkMaskType {
    General,
    Ns35,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GNodeBCategory {
    WideAreaBaseStationCategoryA,
    WideAreaBaseStationCategoryB,
    MediumRangeBaseStation,
    LocalAreaBaseStation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownlinkMaskType {
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AveragingType {
    Rms,
    Log,
    Scalar,
    Maximum,
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SemStatus {
    #[default]
    Fail,
    Pass,
}

impl fmt::Display for SemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemStatus::Fail => f.write_str("Fail"),
            SemStatus::Pass => f.write_str("Pass"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measurement {
    ModAcc = 0,
    Acp = 1,
    Chp = 2,
    Obw = 3,
    Sem = 4,
}

impl Measurement {
    pub const ALL: [Measurement; 5] = [
        Measurement::ModAcc,
        Measurement::Acp,
        Measurement::Chp,
        Measurement::Obw,
        Measurement::Sem,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Measurement::ModAcc => "ModAcc",
            Measurement::Acp => "ACP",
            Measurement::Chp => "CHP",
            Measurement::Obw => "OBW",
            Measurement::Sem => "SEM",
        };
        f.write_str(name)
    }
}

/// Set of measurements enabled on one signal configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MeasurementTypes(u8);

impl MeasurementTypes {
    pub const NONE: MeasurementTypes = MeasurementTypes(0);

    pub fn contains(self, measurement: Measurement) -> bool {
        self.0 & measurement.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_disjoint(self, other: MeasurementTypes) -> bool {
        self.0 & other.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = Measurement> {
        Measurement::ALL.into_iter().filter(move |m| self.contains(*m))
    }
}

impl From<Measurement> for MeasurementTypes {
    fn from(measurement: Measurement) -> Self {
        MeasurementTypes(measurement.bit())
    }
}

impl BitOr for MeasurementTypes {
    type Output = MeasurementTypes;

    fn bitor(self, rhs: MeasurementTypes) -> MeasurementTypes {
        MeasurementTypes(self.0 | rhs.0)
    }
}

impl BitOr<Measurement> for MeasurementTypes {
    type Output = MeasurementTypes;

    fn bitor(self, rhs: Measurement) -> MeasurementTypes {
        MeasurementTypes(self.0 | rhs.bit())
    }
}

impl BitOr for Measurement {
    type Output = MeasurementTypes;

    fn bitor(self, rhs: Measurement) -> MeasurementTypes {
        MeasurementTypes(self.bit() | rhs.bit())
    }
}

impl fmt::Display for MeasurementTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for measurement in self.iter() {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "{}", measurement)?;
            first = false;
        }
        Ok(())
    }
}

// Settings

#[derive(Debug, Clone, PartialEq)]
pub struct DigitalEdgeTrigger {
    pub source: String,
    pub edge: DigitalEdge,
    pub delay: Duration,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepTime {
    pub auto: bool,
    /// Used when `auto` is off.
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Averaging {
    pub enabled: bool,
    pub count: u32,
    pub kind: AveragingType,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementInterval {
    pub unit: MeasurementLengthUnit,
    pub offset: f64,
    pub length: f64,
}

// Results

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ModAccResults {
    /// %
    pub composite_rms_evm_mean: f64,
    /// %
    pub composite_peak_evm_maximum: f64,
    /// Hz
    pub frequency_error_mean: f64,
    /// dBc
    pub iq_origin_offset_mean: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AcpCarrierResults {
    pub absolute_power: f64,
    pub relative_power: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AcpOffsetResults {
    pub lower_relative_power: f64,
    pub upper_relative_power: f64,
    pub lower_absolute_power: f64,
    pub upper_absolute_power: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChpResults {
    pub absolute_power: f64,
    pub relative_power: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ObwResults {
    pub occupied_bandwidth: f64,
    pub absolute_power: f64,
    pub start_frequency: f64,
    pub stop_frequency: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SemCarrierResults {
    pub absolute_integrated_power: f64,
    pub peak_absolute_integrated_power: f64,
    pub peak_frequency: f64,
    pub relative_integrated_power: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SemOffsetMargin {
    pub status: SemStatus,
    pub margin: f64,
    pub margin_frequency: f64,
    pub margin_absolute_power: f64,
    pub margin_relative_power: f64,
}

/// Entry point of a driver: turns a resource name into an open session.
pub trait Driver {
    type Instrument: Instrument;

    fn open_session(&mut self, resource_name: &str) -> Result<Self::Instrument, Error>;
}

/// An open instrument session.
pub trait Instrument {
    type Signal: SignalConfiguration;

    fn configure_frequency_reference(&mut self, source: &str, frequency: f64) -> Result<(), Error>;

    /// Returns the named signal configuration, creating it on first use.
    fn signal_configuration(&mut self, name: &str) -> Result<Self::Signal, Error>;

    fn close(&mut self) -> Result<(), Error>;
}

/// One named group of NR measurement settings and results within a session.
///
/// Fetches are only valid after `initiate`; they block until the
/// acquisition finishes or `timeout` elapses.
pub trait SignalConfiguration {
    fn name(&self) -> &str;

    fn set_selected_ports(&mut self, ports: &str) -> Result<(), Error>;
    fn configure_rf(
        &mut self,
        center_frequency: f64,
        reference_level: f64,
        external_attenuation: f64,
    ) -> Result<(), Error>;
    fn configure_digital_edge_trigger(&mut self, trigger: &DigitalEdgeTrigger) -> Result<(), Error>;

    fn set_link_direction(&mut self, direction: LinkDirection) -> Result<(), Error>;
    fn set_frequency_range(&mut self, range: FrequencyRange) -> Result<(), Error>;
    fn set_band(&mut self, band: u32) -> Result<(), Error>;
    fn set_component_carrier_bandwidth(&mut self, bandwidth: f64) -> Result<(), Error>;
    fn set_subcarrier_spacing(&mut self, spacing: f64) -> Result<(), Error>;

    /// Replaces the current selection.
    fn select_measurements(&mut self, measurements: MeasurementTypes, enable_traces: bool) -> Result<(), Error>;
    fn configure_sweep_time(&mut self, measurement: Measurement, sweep_time: SweepTime) -> Result<(), Error>;
    fn configure_averaging(&mut self, measurement: Measurement, averaging: Averaging) -> Result<(), Error>;
    fn configure_modacc_measurement_interval(&mut self, interval: MeasurementInterval) -> Result<(), Error>;

    fn configure_uplink_mask_type(&mut self, mask: UplinkMaskType) -> Result<(), Error>;
    fn configure_gnodeb_category(&mut self, category: GNodeBCategory) -> Result<(), Error>;
    fn set_downlink_mask_type(&mut self, mask: DownlinkMaskType) -> Result<(), Error>;
    fn set_delta_f_maximum(&mut self, delta_f_maximum: f64) -> Result<(), Error>;
    fn configure_rated_output_power(&mut self, power: f64) -> Result<(), Error>;

    fn commit(&mut self) -> Result<(), Error>;
    fn initiate(&mut self) -> Result<(), Error>;
    fn wait_for_measurement_complete(&mut self, timeout: Duration) -> Result<(), Error>;

    fn fetch_modacc(&mut self, timeout: Duration) -> Result<ModAccResults, Error>;
    fn fetch_acp_offsets(&mut self, timeout: Duration) -> Result<Vec<AcpOffsetResults>, Error>;
    fn fetch_acp_carrier(&mut self, timeout: Duration) -> Result<AcpCarrierResults, Error>;
    fn fetch_chp(&mut self, timeout: Duration) -> Result<ChpResults, Error>;
    fn fetch_obw(&mut self, timeout: Duration) -> Result<ObwResults, Error>;
    fn fetch_sem_lower_offsets(&mut self, timeout: Duration) -> Result<Vec<SemOffsetMargin>, Error>;
    fn fetch_sem_upper_offsets(&mut self, timeout: Duration) -> Result<Vec<SemOffsetMargin>, Error>;
    fn fetch_sem_carrier(&mut self, timeout: Duration) -> Result<SemCarrierResults, Error>;
    fn fetch_sem_status(&mut self, timeout: Duration) -> Result<SemStatus, Error>;

    fn dispose(&mut self) -> Result<(), Error>;
}
