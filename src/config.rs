//! The configuration surface the host can change while the device runs.
//!
//! Everything here is validated synchronously by the caller-facing handle;
//! what reaches the packet reader is always a valid [`ConfigChange`].

use std::time::Duration as StdDuration;

use hifitime::Duration;
use marlu::{constants::VEL_C, LatLngHeight, RADec, ENH};
use thiserror::Error;

/// Default observing wavelength \[metres\]; the 21 cm hydrogen line.
pub const DEFAULT_WAVELENGTH: f64 = 0.211121449;
/// Default filter bandwidth, expressed as a wavelength \[metres\].
pub const DEFAULT_BANDWIDTH: f64 = 1199.169832;
pub const DEFAULT_PLOT_SIZE: usize = 512;
pub const MIN_PLOT_SIZE: usize = 128;
pub const MAX_PLOT_SIZE: usize = 8192;
pub const MIN_WAVELENGTH: f64 = 3.0e-12;
pub const MAX_WAVELENGTH: f64 = 3.0e3;
pub const MIN_BAND_FREQ: f64 = 1.0e3;
pub const MAX_BAND_FREQ: f64 = 1.0e8;
/// Line positions may not stray further than this from the origin on any
/// axis \[metres\].
pub const EARTH_RADIUS_MEAN: f64 = 6_371_000.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("line {line} does not exist (the correlator has {num_lines} lines)")]
    NoSuchLine { line: usize, num_lines: usize },

    #[error("line position {0:?} is not finite or lies further than one Earth radius out")]
    BadPosition(ENH),

    #[error("{name} {value} m is outside [3e-12, 3e3] m")]
    BadWavelength { name: &'static str, value: f64 },

    #[error("plot size {0} px is outside [128, 8192] px")]
    BadPlotSize(usize),

    #[error("frequency band {low} Hz - {high} Hz is invalid; need 1e3 <= low < high <= 1e8")]
    BadFrequencyBand { low: f64, high: f64 },

    #[error("optics are invalid: aperture {aperture} m, focal length {focal_length} m")]
    BadOptics { aperture: f64, focal_length: f64 },

    #[error("target RA/Dec ({ra}, {dec}) rad is invalid")]
    BadTarget { ra: f64, dec: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveEdge {
    #[default]
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    Sample,
    #[default]
    Edge,
}

/// Per-line hardware switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineFlags {
    pub enabled: bool,
    pub power: bool,
    pub active_edge: ActiveEdge,
    pub trigger: TriggerMode,
    pub differential: bool,
}

impl LineFlags {
    pub fn enabled() -> LineFlags {
        LineFlags {
            enabled: true,
            ..Default::default()
        }
    }

    /// The flag word the hardware expects.
    pub fn bits(&self) -> u8 {
        u8::from(self.enabled)
            | u8::from(self.power) << 1
            | u8::from(self.active_edge == ActiveEdge::Low) << 2
            | u8::from(self.trigger == TriggerMode::Edge) << 3
            | u8::from(self.differential) << 4
    }
}

/// Collecting optics, used only for the photon-flux estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Optics {
    pub aperture_m: f64,
    pub focal_length_m: f64,
}

impl Default for Optics {
    fn default() -> Self {
        Optics {
            aperture_m: 1.0,
            focal_length_m: 1.0,
        }
    }
}

impl Optics {
    /// Solid angle seen by one line \[steradians\].
    pub fn steradian(&self) -> f64 {
        (self.aperture_m * 0.5 / self.focal_length_m).asin().powi(2)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Observing wavelength \[metres\].
    pub wavelength: f64,

    /// Filter bandwidth, expressed as a wavelength \[metres\].
    pub bandwidth: f64,

    /// Side length of the square preview image \[pixels\].
    pub plot_size: usize,

    /// How often statistics are reported (and totals reset).
    pub reporting_period: StdDuration,

    pub optics: Optics,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            wavelength: DEFAULT_WAVELENGTH,
            bandwidth: DEFAULT_BANDWIDTH,
            plot_size: DEFAULT_PLOT_SIZE,
            reporting_period: StdDuration::from_millis(500),
            optics: Optics::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_wavelength("wavelength", self.wavelength)?;
        check_wavelength("bandwidth", self.bandwidth)?;
        if !(MIN_PLOT_SIZE..=MAX_PLOT_SIZE).contains(&self.plot_size) {
            return Err(ConfigError::BadPlotSize(self.plot_size));
        }
        let Optics {
            aperture_m,
            focal_length_m,
        } = self.optics;
        if !(aperture_m > 0.0 && focal_length_m > 0.0 && aperture_m * 0.5 <= focal_length_m) {
            return Err(ConfigError::BadOptics {
                aperture: aperture_m,
                focal_length: focal_length_m,
            });
        }
        Ok(())
    }

    /// The observed band as `(low, high)` \[Hz\].
    pub fn frequency_band(&self) -> (f64, f64) {
        let centre = VEL_C / self.wavelength;
        let width = VEL_C / self.bandwidth;
        (centre - width / 2.0, centre + width / 2.0)
    }

    /// Set wavelength and bandwidth from a frequency band \[Hz\].
    pub fn with_frequency_band(&self, low: f64, high: f64) -> Result<Settings, ConfigError> {
        if !(MIN_BAND_FREQ..=MAX_BAND_FREQ).contains(&low)
            || !(MIN_BAND_FREQ..=MAX_BAND_FREQ).contains(&high)
            || low >= high
        {
            return Err(ConfigError::BadFrequencyBand { low, high });
        }
        let width = high - low;
        let centre = low + width / 2.0;
        let settings = Settings {
            wavelength: VEL_C / centre,
            bandwidth: VEL_C / width,
            ..self.clone()
        };
        settings.validate()?;
        Ok(settings)
    }
}

fn check_wavelength(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (MIN_WAVELENGTH..=MAX_WAVELENGTH).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::BadWavelength { name, value })
    }
}

pub fn validate_position(position: ENH) -> Result<(), ConfigError> {
    let in_range = |v: f64| v.is_finite() && v.abs() <= EARTH_RADIUS_MEAN;
    if in_range(position.e) && in_range(position.n) && in_range(position.h) {
        Ok(())
    } else {
        Err(ConfigError::BadPosition(position))
    }
}

/// Where the array is and what it is pointed at.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub site: LatLngHeight,
    pub target: RADec,

    /// UT1 - UTC. Zero is fine for delay tracking; it shifts the sidereal
    /// time by under a second.
    pub dut1: Duration,
}

impl Observation {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let RADec { ra, dec } = self.target;
        if !ra.is_finite() || !dec.is_finite() || dec.abs() > std::f64::consts::FRAC_PI_2 {
            return Err(ConfigError::BadTarget { ra, dec });
        }
        Ok(())
    }
}

/// A validated change, applied by the packet reader at the next tick
/// boundary.
#[derive(Debug, Clone)]
pub enum ConfigChange {
    LinePosition { line: usize, position: ENH },
    LineFlags { line: usize, flags: LineFlags },
    Settings(Settings),
    Target(RADec),
}
