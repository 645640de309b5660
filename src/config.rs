//! Measurement settings for one pipelined NR run.
//!
//! Every field has a default, so a TOML file only needs the values it changes.
//! Durations are written as humantime strings (`"10s"`, `"1ms"`).

use std::{fs, io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::nrmx::{
    Averaging, AveragingType, DigitalEdge, DigitalEdgeTrigger, DownlinkMaskType, FrequencyRange,
    GNodeBCategory, LinkDirection, MeasurementInterval, MeasurementLengthUnit, SweepTime,
    UplinkMaskType,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(io::Error),

    #[error("parse error: {0}")]
    ParseError(toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    pub resource_name: String,
    pub iterations: usize,
    /// Bound on every wait and fetch.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub frequency_reference: FrequencyReferenceConfig,
    pub rf: RfConfig,
    pub trigger: TriggerConfig,
    pub carrier: CarrierConfig,
    pub modacc: ModAccConfig,
    pub sem: SemConfig,
    pub sweep_time: SweepTimeConfig,
    pub averaging: AveragingConfig,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            resource_name: "BCN_02".to_string(),
            iterations: 100,
            timeout: Duration::from_secs(10),
            frequency_reference: Default::default(),
            rf: Default::default(),
            trigger: Default::default(),
            carrier: Default::default(),
            modacc: Default::default(),
            sem: Default::default(),
            sweep_time: Default::default(),
            averaging: Default::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencyReferenceConfig {
    pub source: String,
    /// Hz
    pub frequency: f64,
}

impl Default for FrequencyReferenceConfig {
    fn default() -> Self {
        Self {
            source: "OnboardClock".to_string(),
            frequency: 10.0e6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfConfig {
    pub selected_ports: String,
    /// Hz
    pub center_frequency: f64,
    /// dBm
    pub reference_level: f64,
    /// dB
    pub external_attenuation: f64,
}

impl Default for RfConfig {
    fn default() -> Self {
        Self {
            selected_ports: "if0".to_string(),
            center_frequency: 9e9,
            reference_level: 0.0,
            external_attenuation: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub enabled: bool,
    pub source: String,
    pub edge: DigitalEdge,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: "PXI_Trig0".to_string(),
            edge: DigitalEdge::Rising,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarrierConfig {
    pub link_direction: LinkDirection,
    pub frequency_range: FrequencyRange,
    pub band: u32,
    /// Hz
    pub bandwidth: f64,
    /// Hz
    pub subcarrier_spacing: f64,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            link_direction: LinkDirection::Uplink,
            frequency_range: FrequencyRange::Range2,
            band: 78,
            bandwidth: 100e6,
            subcarrier_spacing: 60e3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModAccConfig {
    pub measurement_length_unit: MeasurementLengthUnit,
    pub measurement_offset: f64,
    pub measurement_length: f64,
}

impl Default for ModAccConfig {
    fn default() -> Self {
        Self {
            measurement_length_unit: MeasurementLengthUnit::Slot,
            measurement_offset: 0.0,
            measurement_length: 1.0,
        }
    }
}

/// Mask selection. Only the fields of the configured link direction are used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemConfig {
    pub uplink_mask_type: UplinkMaskType,
    pub gnodeb_category: GNodeBCategory,
    pub downlink_mask_type: DownlinkMaskType,
    /// Hz
    pub delta_f_maximum: f64,
    /// dBm
    pub rated_output_power: f64,
}

impl Default for SemConfig {
    fn default() -> Self {
        Self {
            uplink_mask_type: UplinkMaskType::General,
            gnodeb_category: GNodeBCategory::WideAreaBaseStationCategoryA,
            downlink_mask_type: DownlinkMaskType::Standard,
            delta_f_maximum: 15.0e6,
            rated_output_power: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepTimeConfig {
    pub auto: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SweepTimeConfig {
    fn default() -> Self {
        Self {
            auto: true,
            interval: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AveragingConfig {
    pub enabled: bool,
    pub count: u32,
    pub kind: AveragingType,
}

impl Default for AveragingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count: 10,
            kind: AveragingType::Rms,
        }
    }
}

impl MeasurementConfig {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(Error::IoError)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(Error::ParseError)
    }

    pub fn validate(&self) -> Result<(), Error> {
        fn invalid(field: &'static str, reason: &str) -> Error {
            Error::InvalidValue {
                field,
                reason: reason.to_string(),
            }
        }

        if self.resource_name.trim().is_empty() {
            return Err(invalid("resource_name", "must not be empty"));
        }
        if self.iterations == 0 {
            return Err(invalid("iterations", "must be at least 1"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout", "must be positive"));
        }
        if self.rf.selected_ports.trim().is_empty() {
            return Err(invalid("rf.selected_ports", "must not be empty"));
        }

        let finite = [
            ("frequency_reference.frequency", self.frequency_reference.frequency),
            ("rf.center_frequency", self.rf.center_frequency),
            ("rf.reference_level", self.rf.reference_level),
            ("rf.external_attenuation", self.rf.external_attenuation),
            ("modacc.measurement_offset", self.modacc.measurement_offset),
            ("sem.delta_f_maximum", self.sem.delta_f_maximum),
            ("sem.rated_output_power", self.sem.rated_output_power),
        ];
        for (field, value) in finite {
            if !value.is_finite() {
                return Err(invalid(field, "must be finite"));
            }
        }

        let positive = [
            ("frequency_reference.frequency", self.frequency_reference.frequency),
            ("rf.center_frequency", self.rf.center_frequency),
            ("carrier.bandwidth", self.carrier.bandwidth),
            ("carrier.subcarrier_spacing", self.carrier.subcarrier_spacing),
            ("modacc.measurement_length", self.modacc.measurement_length),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(field, "must be positive and finite"));
            }
        }

        if self.averaging.count == 0 {
            return Err(invalid("averaging.count", "must be at least 1"));
        }

        Ok(())
    }

    pub fn trigger(&self) -> DigitalEdgeTrigger {
        DigitalEdgeTrigger {
            source: self.trigger.source.clone(),
            edge: self.trigger.edge,
            delay: self.trigger.delay,
            enabled: self.trigger.enabled,
        }
    }

    pub fn sweep_time(&self) -> SweepTime {
        SweepTime {
            auto: self.sweep_time.auto,
            interval: self.sweep_time.interval,
        }
    }

    pub fn averaging(&self) -> Averaging {
        Averaging {
            enabled: self.averaging.enabled,
            count: self.averaging.count,
            kind: self.averaging.kind,
        }
    }

    pub fn measurement_interval(&self) -> MeasurementInterval {
        MeasurementInterval {
            unit: self.modacc.measurement_length_unit,
            offset: self.modacc.measurement_offset,
            length: self.modacc.measurement_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MeasurementConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.iterations, 100);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.carrier.link_direction, LinkDirection::Uplink);
        assert_eq!(config.averaging.kind, AveragingType::Rms);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = MeasurementConfig::from_toml_str(
            r#"
            resource_name = "RFSA_1"
            iterations = 3
            timeout = "2s"

            [carrier]
            link_direction = "downlink"
            frequency_range = "range1"

            [sweep_time]
            interval = "5ms"
            "#,
        )
        .unwrap();

        assert_eq!(config.resource_name, "RFSA_1");
        assert_eq!(config.iterations, 3);
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.carrier.link_direction, LinkDirection::Downlink);
        assert_eq!(config.carrier.frequency_range, FrequencyRange::Range1);
        assert_eq!(config.carrier.band, 78);
        assert_eq!(config.sweep_time.interval, Duration::from_millis(5));
        assert!(config.sweep_time.auto);
        assert_eq!(config.rf, RfConfig::default());
    }

    #[test]
    fn unknown_enum_value_is_a_parse_error() {
        let result = MeasurementConfig::from_toml_str(
            r#"
            [carrier]
            link_direction = "sideways"
            "#,
        );
        assert!(matches!(result, Err(Error::ParseError(_))));
    }

    #[test]
    fn zero_iterations_rejected() {
        let config = MeasurementConfig {
            iterations: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("iterations"));
    }

    #[test]
    fn nan_center_frequency_rejected() {
        let mut config = MeasurementConfig::default();
        config.rf.center_frequency = f64::NAN;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("rf.center_frequency"));
    }

    #[test]
    fn negative_bandwidth_rejected() {
        let mut config = MeasurementConfig::default();
        config.carrier.bandwidth = -100e6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_averaging_count_rejected() {
        let mut config = MeasurementConfig::default();
        config.averaging.count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_resource_rejected() {
        let config = MeasurementConfig {
            resource_name: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn driver_settings_follow_config() {
        let config = MeasurementConfig::default();
        let trigger = config.trigger();
        assert_eq!(trigger.source, "PXI_Trig0");
        assert_eq!(trigger.edge, DigitalEdge::Rising);
        assert!(trigger.enabled);

        let interval = config.measurement_interval();
        assert_eq!(interval.unit, MeasurementLengthUnit::Slot);
        assert_eq!(interval.length, 1.0);

        let averaging = config.averaging();
        assert!(!averaging.enabled);
        assert_eq!(averaging.count, 10);
    }
}
