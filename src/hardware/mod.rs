pub mod sim;

use std::time::Duration;

use thiserror::Error;

/// One lag bin of a correlation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Correlation {
    pub magnitude: f64,
    pub counts: u64,
    pub phase: f64,
}

/// A hardware sample's correlations across all of its lag bins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LagVector(pub Vec<Correlation>);

impl LagVector {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The zero-lag bin, `len / 2`.
    pub fn center(&self) -> Option<&Correlation> {
        self.0.get(self.0.len() / 2)
    }

    /// The center lag's magnitude per count, if any counts arrived.
    pub fn normalized_center(&self) -> Option<f64> {
        self.center()
            .filter(|c| c.counts > 0)
            .map(|c| c.magnitude / c.counts as f64)
    }

    pub fn magnitudes(&self) -> impl ExactSizeIterator<Item = f64> + '_ {
        self.0.iter().map(|c| c.magnitude)
    }
}

/// Everything the correlator produced in one hardware integration tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrelationPacket {
    /// Pulse counts, one per line.
    pub counts: Vec<u64>,

    /// One per line.
    pub autocorrelations: Vec<LagVector>,

    /// One per baseline, in upper-triangle order.
    pub crosscorrelations: Vec<LagVector>,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("the correlator is not connected")]
    NotConnected,

    #[error("line {0} is out of range")]
    NoSuchLine(usize),
}

/// The fixed capabilities the hardware reports at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareInfo {
    pub num_lines: usize,
    pub num_baselines: usize,
    pub auto_lag_size: usize,
    pub cross_lag_size: usize,

    /// \[Hz\]
    pub clock_frequency: f64,

    /// Number of taps in each delay line.
    pub delayline_depth: u32,

    pub packet_period: Duration,
}

impl HardwareInfo {
    /// Number of lags in one crosscorrelation row (negative and positive
    /// lags around zero).
    pub fn cross_width(&self) -> usize {
        (self.cross_lag_size * 2).saturating_sub(1)
    }
}

/// The link to a cross-correlator. Implementations are driven from a single
/// thread (the packet reader) once the device is connected.
pub trait Transport: Send {
    fn is_connected(&self) -> bool;

    fn is_detected(&mut self) -> bool;

    fn line_count(&self) -> usize;

    fn baseline_count(&self) -> usize;

    fn autocorrelator_lag_size(&self) -> usize;

    fn crosscorrelator_lag_size(&self) -> usize;

    /// \[Hz\]
    fn clock_frequency(&self) -> f64;

    fn delayline_depth(&self) -> u32;

    /// How long the hardware takes to produce one packet.
    fn packet_period(&self) -> Duration;

    /// Fetch the next packet. `Ok(None)` means the hardware doesn't have one
    /// ready yet.
    fn get_packet(&mut self) -> Result<Option<CorrelationPacket>, TransportError>;

    /// Program a line's crosscorrelation delay \[clock ticks\].
    fn set_channel_delay(&mut self, line: usize, ticks: u32) -> Result<(), TransportError>;

    /// Program a line's switches (see [`crate::config::LineFlags::bits`]).
    fn set_line_flags(&mut self, line: usize, bits: u8) -> Result<(), TransportError>;

    fn set_capture(&mut self, enabled: bool) -> Result<(), TransportError>;

    fn info(&self) -> HardwareInfo {
        HardwareInfo {
            num_lines: self.line_count(),
            num_baselines: self.baseline_count(),
            auto_lag_size: self.autocorrelator_lag_size(),
            cross_lag_size: self.crosscorrelator_lag_size(),
            clock_frequency: self.clock_frequency(),
            delayline_depth: self.delayline_depth(),
            packet_period: self.packet_period(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_is_half_the_length() {
        let lags = LagVector(
            (0..5)
                .map(|i| Correlation {
                    magnitude: i as f64,
                    counts: 2,
                    phase: 0.0,
                })
                .collect(),
        );
        assert_eq!(lags.center().unwrap().magnitude, 2.0);
        assert_eq!(lags.normalized_center(), Some(1.0));
    }

    #[test]
    fn no_counts_means_no_normalized_value() {
        let lags = LagVector(vec![Correlation::default(); 3]);
        assert_eq!(lags.normalized_center(), None);
        assert_eq!(LagVector::default().normalized_center(), None);
    }
}
