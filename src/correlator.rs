//! The engine state shared by the packet reader and the device handle.
//!
//! The packet reader is the only writer of the per-cycle buffers and the
//! delay state. The device handle only starts and aborts cycles and takes
//! reports; configuration changes reach the engine through a queue drained by
//! the reader at tick boundaries.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration as StdDuration,
};

use hifitime::Epoch;
use log::{debug, info, trace, warn};

use crate::{
    accumulate::{Accumulator, RunningTotals},
    array::AntennaArray,
    config::{ConfigChange, Observation, Settings},
    cycle::{CycleError, IntegrationCycle},
    delay::DelayCompensator,
    device::ConnectError,
    geometry::SkyDirection,
    hardware::{CorrelationPacket, HardwareInfo},
    stats::{build_report, Report},
    write::{CycleMetadata, FrozenCycle},
};

/// A hardware write the reader performs once the engine lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ChannelDelay { line: usize, ticks: u32 },
    LineFlags { line: usize, bits: u8 },
}

/// What one packet did to the engine.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub commands: Vec<Command>,

    /// Set when this tick completed an integration.
    pub finished: Option<FrozenCycle>,
}

#[derive(Debug)]
pub struct Correlator {
    info: HardwareInfo,
    array: AntennaArray,
    settings: Settings,
    observation: Observation,
    compensator: DelayCompensator,
    accumulator: Accumulator,
    totals: RunningTotals,
    cycle: IntegrationCycle,

    /// Wavelength and bandwidth the running cycle was started with.
    cycle_band: (f64, f64),

    reference: Option<usize>,
    ticks: u64,
    lag_misfit_logged: bool,
}

impl Correlator {
    pub fn new(
        info: HardwareInfo,
        settings: Settings,
        observation: Observation,
    ) -> Result<Correlator, ConnectError> {
        settings.validate()?;
        observation.validate()?;
        if info.num_baselines != info.num_lines * info.num_lines.saturating_sub(1) / 2 {
            return Err(ConnectError::BaselineMismatch {
                lines: info.num_lines,
                baselines: info.num_baselines,
            });
        }
        let array = AntennaArray::new(info.num_lines, settings.wavelength, settings.bandwidth)
            .ok_or(ConnectError::NoLines)?;

        Ok(Correlator {
            compensator: DelayCompensator::new(info.clock_frequency, info.delayline_depth),
            accumulator: Accumulator::new(
                info.num_lines,
                info.num_baselines,
                info.auto_lag_size,
                info.cross_width(),
                settings.plot_size,
            ),
            totals: RunningTotals::new(info.num_lines, info.num_baselines),
            cycle: IntegrationCycle::default(),
            cycle_band: (settings.wavelength, settings.bandwidth),
            reference: None,
            ticks: 0,
            lag_misfit_logged: false,
            info,
            array,
            settings,
            observation,
        })
    }

    pub fn info(&self) -> &HardwareInfo {
        &self.info
    }

    pub fn array(&self) -> &AntennaArray {
        &self.array
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn observation(&self) -> &Observation {
        &self.observation
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    pub fn cycle(&self) -> &IntegrationCycle {
        &self.cycle
    }

    /// The current delay reference line, if compensation has run.
    pub fn reference(&self) -> Option<usize> {
        self.reference
    }

    /// Packets processed since connect.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Apply a queued configuration change. Returns the hardware write it
    /// needs, if any.
    pub fn apply(&mut self, change: ConfigChange) -> Option<Command> {
        match change {
            ConfigChange::LinePosition { line, position } => {
                if line >= self.array.num_lines() {
                    warn!("Ignoring a position for line {line}; it doesn't exist");
                    return None;
                }
                debug!("Line {line} moved to {position:?}");
                self.array.set_position(line, position);
                None
            }

            ConfigChange::LineFlags { line, flags } => {
                if line >= self.array.num_lines() {
                    warn!("Ignoring flags for line {line}; it doesn't exist");
                    return None;
                }
                debug!("Line {line} flags now {flags:?}");
                self.array.set_flags(line, flags);
                Some(Command::LineFlags {
                    line,
                    bits: flags.bits(),
                })
            }

            ConfigChange::Settings(settings) => {
                debug!(
                    "Wavelength {} m, bandwidth {} m, plot size {} px",
                    settings.wavelength, settings.bandwidth, settings.plot_size
                );
                self.array.set_band(settings.wavelength, settings.bandwidth);
                // A running integration keeps its preview size.
                if self.cycle.is_idle() {
                    self.accumulator.resize_preview(settings.plot_size);
                }
                self.settings = settings;
                None
            }

            ConfigChange::Target(target) => {
                debug!(
                    "Target now RA {:.4} deg, Dec {:.4} deg",
                    target.ra.to_degrees(),
                    target.dec.to_degrees()
                );
                self.observation.target = target;
                None
            }
        }
    }

    pub fn direction_at(&self, now: Epoch) -> SkyDirection {
        SkyDirection::at_epoch(
            self.observation.target,
            self.observation.site,
            now,
            self.observation.dut1,
        )
    }

    /// Recompute the delay map for `direction` and commit each line's delay.
    /// Lines left out of the map are reset to zero delay. Returns the delay
    /// line writes for every mapped line.
    fn compensate(&mut self, direction: SkyDirection) -> Vec<Command> {
        let map = self.compensator.compute(
            &self.array.positions(),
            &self.array.enabled_mask(),
            direction,
        );

        let reference = map.as_ref().map(|m| m.reference);
        if reference != self.reference {
            match reference {
                Some(r) => debug!("Line {r} is now the delay reference"),
                None => debug!("No delay reference; compensation is idle"),
            }
            self.reference = reference;
        }

        let mut commands = vec![];
        for index in 0..self.array.num_lines() {
            let channel = map.as_ref().and_then(|m| m.get(index));
            if let Some(line) = self.array.line_mut(index) {
                line.delay_s = channel.map_or(0.0, |c| c.delay_s);
            }
            if let Some(c) = channel {
                commands.push(Command::ChannelDelay {
                    line: c.line,
                    ticks: c.ticks,
                });
            }
        }
        commands
    }

    /// Consume exactly one packet: track the sky, update the live totals,
    /// append a row while integrating and finalize a cycle that is due.
    pub fn process_packet(&mut self, packet: &CorrelationPacket, now: Epoch) -> TickOutcome {
        self.ticks += 1;
        let direction = self.direction_at(now);
        trace!(
            "Tick {}: HA {:.3} deg, Dec {:.3} deg",
            self.ticks,
            direction.hadec.ha.to_degrees(),
            direction.hadec.dec.to_degrees()
        );

        // Delays track the sky whether or not an integration is running.
        let commands = self.compensate(direction);

        self.totals.add(packet, &self.array);
        if self.cycle.is_integrating() {
            let misfits = self.accumulator.accumulate(packet, &self.array, direction);
            if misfits > 0 && !self.lag_misfit_logged {
                warn!(
                    "The correlator sent lag vectors that don't match the advertised \
                     {} auto / {} cross lags; padding them",
                    self.info.auto_lag_size,
                    self.info.cross_width()
                );
                self.lag_misfit_logged = true;
            }
        }

        TickOutcome {
            commands,
            finished: self.finalize_if_due(now),
        }
    }

    /// If the running integration has had its time, detach its buffers and
    /// move to finalizing. The cycle stays there until [`finish_cycle`] is
    /// called, once the detached buffers are serialized.
    ///
    /// [`finish_cycle`]: Correlator::finish_cycle
    pub fn finalize_if_due(&mut self, now: Epoch) -> Option<FrozenCycle> {
        if !self.cycle.is_due(now) {
            return None;
        }
        let (start, _) = self.cycle.begin_finalize()?;
        let buffers = self.accumulator.freeze();
        info!(
            "Integration complete after {:.3} s",
            (now - start).to_seconds()
        );
        Some(FrozenCycle {
            buffers,
            baseline_pairs: self
                .array
                .baselines()
                .iter()
                .map(|b| (b.first, b.second))
                .collect(),
            metadata: CycleMetadata {
                start,
                duration: now - start,
                wavelength: self.cycle_band.0,
                bandwidth: self.cycle_band.1,
                target: self.observation.target,
                site: self.observation.site,
            },
        })
    }

    /// Return to idle after a finalized cycle has been serialized.
    pub fn finish_cycle(&mut self) {
        self.cycle.finish();
        self.accumulator.resize_preview(self.settings.plot_size);
    }

    pub fn start_integration(&mut self, seconds: f64, now: Epoch) -> Result<(), CycleError> {
        self.cycle.start(seconds, now)?;
        self.cycle_band = (self.settings.wavelength, self.settings.bandwidth);
        info!("Integrating for {seconds} s");
        Ok(())
    }

    /// Drop the running integration and everything it collected.
    pub fn abort_integration(&mut self) -> bool {
        if !self.cycle.abort() {
            return false;
        }
        self.accumulator.clear();
        self.accumulator.resize_preview(self.settings.plot_size);
        info!("Integration aborted");
        true
    }

    /// Seconds left in the running integration, clamped at zero.
    pub fn integration_left(&self, now: Epoch) -> Option<f64> {
        self.cycle.remaining(now).map(|r| r.max(0.0))
    }

    /// Statistics for the reporting period just ended. The running totals
    /// start again from zero.
    pub fn report(&mut self, period: StdDuration, now: Epoch) -> Report {
        let totals = self.totals.take();
        build_report(
            &totals,
            &self.array,
            &self.settings,
            period,
            self.integration_left(now),
        )
    }
}

/// Lock the engine. The engine is consistent between ticks, so a panic on
/// another thread doesn't invalidate it.
pub fn lock(engine: &Mutex<Correlator>) -> MutexGuard<Correlator> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}
