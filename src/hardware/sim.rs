//! A software stand-in for the correlator, paced by its packet period.

use std::time::{Duration, Instant};

use log::trace;

use super::{Correlation, CorrelationPacket, LagVector, Transport, TransportError};

pub struct SimulatedCorrelator {
    num_lines: usize,
    auto_lag_size: usize,
    cross_lag_size: usize,
    clock_frequency: f64,
    delayline_depth: u32,
    packet_period: Duration,

    connected: bool,
    capture: bool,
    next_packet: Option<Instant>,
    tick: u64,

    /// What the driver last programmed, kept for inspection.
    pub delays: Vec<u32>,
    pub line_flags: Vec<u8>,
}

impl SimulatedCorrelator {
    pub fn new(num_lines: usize, packet_period: Duration) -> SimulatedCorrelator {
        SimulatedCorrelator {
            num_lines,
            auto_lag_size: 8,
            cross_lag_size: 8,
            clock_frequency: 400.0e6,
            delayline_depth: 1024,
            packet_period,
            connected: true,
            capture: false,
            next_packet: None,
            tick: 0,
            delays: vec![0; num_lines],
            line_flags: vec![0; num_lines],
        }
    }

    pub fn with_lag_sizes(mut self, auto_lag_size: usize, cross_lag_size: usize) -> Self {
        self.auto_lag_size = auto_lag_size;
        self.cross_lag_size = cross_lag_size;
        self
    }

    /// Pulse counts for one line in one packet. Lines that are switched off
    /// see nothing.
    fn line_counts(&self, line: usize) -> u64 {
        if self.line_flags[line] & 1 == 0 {
            return 0;
        }
        1000 + 37 * line as u64 + (self.tick % 17) * 3
    }

    fn lag_profile(&self, width: usize, counts: u64, coherence: f64) -> LagVector {
        let centre = (width / 2) as f64;
        LagVector(
            (0..width)
                .map(|k| {
                    let d = k as f64 - centre;
                    Correlation {
                        magnitude: counts as f64 * coherence * (-d * d / 4.0).exp(),
                        counts,
                        phase: 0.0,
                    }
                })
                .collect(),
        )
    }

    fn make_packet(&self) -> CorrelationPacket {
        let counts: Vec<u64> = (0..self.num_lines).map(|l| self.line_counts(l)).collect();
        let autocorrelations = counts
            .iter()
            .map(|&c| self.lag_profile(self.auto_lag_size, c, 1.0))
            .collect();
        let cross_width = (self.cross_lag_size * 2).saturating_sub(1);
        let mut crosscorrelations = Vec::with_capacity(self.baseline_count());
        for i in 0..self.num_lines {
            for j in i + 1..self.num_lines {
                // Better delay matching gives a more coherent signal.
                let mismatch = self.delays[i].abs_diff(self.delays[j]) as f64;
                let coherence = 0.5 / (1.0 + mismatch / 64.0);
                crosscorrelations.push(self.lag_profile(
                    cross_width,
                    counts[i].min(counts[j]),
                    coherence,
                ));
            }
        }
        CorrelationPacket {
            counts,
            autocorrelations,
            crosscorrelations,
        }
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
    }
}

impl Transport for SimulatedCorrelator {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_detected(&mut self) -> bool {
        self.connected && self.num_lines > 0
    }

    fn line_count(&self) -> usize {
        self.num_lines
    }

    fn baseline_count(&self) -> usize {
        self.num_lines * self.num_lines.saturating_sub(1) / 2
    }

    fn autocorrelator_lag_size(&self) -> usize {
        self.auto_lag_size
    }

    fn crosscorrelator_lag_size(&self) -> usize {
        self.cross_lag_size
    }

    fn clock_frequency(&self) -> f64 {
        self.clock_frequency
    }

    fn delayline_depth(&self) -> u32 {
        self.delayline_depth
    }

    fn packet_period(&self) -> Duration {
        self.packet_period
    }

    fn get_packet(&mut self) -> Result<Option<CorrelationPacket>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if !self.capture {
            return Ok(None);
        }
        let now = Instant::now();
        match self.next_packet {
            Some(next) if now < next => return Ok(None),
            _ => self.next_packet = Some(now + self.packet_period),
        }
        self.tick += 1;
        trace!("Simulated packet {}", self.tick);
        Ok(Some(self.make_packet()))
    }

    fn set_channel_delay(&mut self, line: usize, ticks: u32) -> Result<(), TransportError> {
        let delay = self
            .delays
            .get_mut(line)
            .ok_or(TransportError::NoSuchLine(line))?;
        *delay = ticks.min(self.delayline_depth.saturating_sub(1));
        Ok(())
    }

    fn set_line_flags(&mut self, line: usize, bits: u8) -> Result<(), TransportError> {
        let flags = self
            .line_flags
            .get_mut(line)
            .ok_or(TransportError::NoSuchLine(line))?;
        *flags = bits;
        Ok(())
    }

    fn set_capture(&mut self, enabled: bool) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.capture = enabled;
        self.next_packet = None;
        Ok(())
    }
}
