//! Live statistics, produced every reporting tick.

use std::time::Duration;

use marlu::constants::VEL_C;

use crate::{accumulate::RunningTotals, array::AntennaArray, config::Settings};

const PLANCK: f64 = 6.626_070_15e-34;
/// Luminous efficacy at 555 nm \[lm/W\].
const LUMINOUS_EFFICACY: f64 = 683.0;

/// Lumens carried by one photon per second at `wavelength` \[metres\].
pub fn lumen(wavelength: f64) -> f64 {
    LUMINOUS_EFFICACY * PLANCK * VEL_C / wavelength
}

/// Flux of a source of relative magnitude `magnitude` through the filter
/// \[lumens\].
pub fn photon_flux(magnitude: f64, bandwidth: f64, wavelength: f64, steradian: f64) -> f64 {
    10f64.powf(-0.4 * magnitude) * lumen(wavelength) * steradian * bandwidth
}

/// Inverse of [`photon_flux`]. `None` for a non-positive flux. A raw count
/// rate can be passed as the flux.
pub fn relative_magnitude(
    flux: f64,
    bandwidth: f64,
    wavelength: f64,
    steradian: f64,
) -> Option<f64> {
    let reference = photon_flux(0.0, bandwidth, wavelength, steradian);
    if flux > 0.0 && reference > 0.0 {
        Some(-2.5 * (flux / reference).log10())
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineReport {
    pub line: usize,
    pub enabled: bool,

    /// Compensated delay \[seconds\].
    pub delay_s: f64,

    pub counts_per_second: f64,

    /// Count rate per [`lumen`] at the observing wavelength.
    pub flux: f64,

    /// The same for a magnitude-0 source.
    pub flux0: f64,

    /// Relative magnitude of the raw count rate.
    pub magnitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationReport {
    pub first: usize,
    pub second: usize,
    pub correlations_per_second: f64,

    /// Zero-lag magnitude per count.
    pub coherence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub lines: Vec<LineReport>,
    pub correlations: Vec<CorrelationReport>,

    /// Seconds left in the running integration, if there is one.
    pub integration_left: Option<f64>,
}

/// Turn one reporting period's totals into rates and estimates.
pub fn build_report(
    totals: &RunningTotals,
    array: &AntennaArray,
    settings: &Settings,
    period: Duration,
    integration_left: Option<f64>,
) -> Report {
    let seconds = period.as_secs_f64().max(f64::EPSILON);
    let steradian = settings.optics.steradian();
    let lumen = lumen(settings.wavelength);
    let flux0 = photon_flux(0.0, settings.bandwidth, settings.wavelength, steradian) / lumen;

    let lines = array
        .lines()
        .iter()
        .map(|line| {
            let counts = totals.counts.get(line.index).copied().unwrap_or(0.0);
            let counts_per_second = counts / seconds;
            LineReport {
                line: line.index,
                enabled: line.is_enabled(),
                delay_s: line.delay_s,
                counts_per_second,
                flux: counts_per_second / lumen,
                flux0,
                magnitude: relative_magnitude(
                    counts_per_second,
                    settings.bandwidth,
                    settings.wavelength,
                    steradian,
                ),
            }
        })
        .collect();

    let correlations = array
        .baselines()
        .iter()
        .map(|baseline| {
            let total = totals
                .correlations
                .get(baseline.index)
                .copied()
                .unwrap_or_default();
            CorrelationReport {
                first: baseline.first,
                second: baseline.second,
                correlations_per_second: total.magnitude / seconds,
                coherence: if total.counts > 0.0 {
                    total.magnitude / total.counts
                } else {
                    0.0
                },
            }
        })
        .collect();

    Report {
        lines,
        correlations,
        integration_left,
    }
}
