//! The host-facing handle: connect, configure, integrate, disconnect.

use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, info, warn};
use marlu::{RADec, ENH};
use thiserror::Error;

use crate::{
    config::{validate_position, ConfigChange, ConfigError, LineFlags, Observation, Settings},
    correlator::{lock, Correlator},
    cycle::CycleError,
    hardware::{HardwareInfo, Transport, TransportError},
    reader::{Clock, PacketReader},
    stats::Report,
    write::{ImageEncoder, IntegrationOutput},
};

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("no correlator was detected")]
    NotDetected,

    #[error("the correlator reports no lines")]
    NoLines,

    #[error("the correlator reports {baselines} baselines for {lines} lines")]
    BaselineMismatch { lines: usize, baselines: usize },

    #[error("couldn't start the packet reader: {0}")]
    Thread(std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A connected correlator. The packet reader runs until [`Device::disconnect`]
/// is called or the handle is dropped.
pub struct Device<T: Transport + 'static> {
    info: HardwareInfo,
    engine: Arc<Mutex<Correlator>>,
    changes: Sender<ConfigChange>,
    outputs: Receiver<IntegrationOutput>,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicCell<bool>>,
    reader: Option<JoinHandle<T>>,

    /// The latest requested settings, which may not have reached the engine
    /// yet.
    settings: Settings,
}

impl<T: Transport + 'static> Device<T> {
    /// Handshake with the hardware, enable capture and start the packet
    /// reader. Nothing is retried; the caller may try the whole connect again.
    pub fn connect<E: ImageEncoder + Send + 'static>(
        mut transport: T,
        settings: Settings,
        observation: Observation,
        encoder: E,
        clock: Arc<dyn Clock>,
    ) -> Result<Device<T>, ConnectError> {
        if !transport.is_detected() {
            return Err(ConnectError::NotDetected);
        }
        let info = transport.info();
        if info.num_lines == 0 {
            return Err(ConnectError::NoLines);
        }
        let engine = Correlator::new(info.clone(), settings.clone(), observation)?;
        info!(
            "Connected to a {}-line correlator: {} baselines, {} auto lags, {} cross lags, \
             {} MHz clock, delay lines {} deep, packet every {:?}",
            info.num_lines,
            info.num_baselines,
            info.auto_lag_size,
            info.cross_width(),
            info.clock_frequency / 1e6,
            info.delayline_depth,
            info.packet_period,
        );
        transport.set_capture(true)?;

        let engine = Arc::new(Mutex::new(engine));
        let (changes, change_rx) = unbounded();
        let (output_tx, outputs) = unbounded();
        let stop = Arc::new(AtomicCell::new(false));
        let reader = PacketReader::new(
            transport,
            Arc::clone(&engine),
            change_rx,
            output_tx,
            encoder,
            Arc::clone(&clock),
        );
        let reader = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("packet-reader".to_string())
                .spawn(move || reader.run(&stop))
                .map_err(ConnectError::Thread)?
        };

        Ok(Device {
            info,
            engine,
            changes,
            outputs,
            clock,
            stop,
            reader: Some(reader),
            settings,
        })
    }

    pub fn info(&self) -> &HardwareInfo {
        &self.info
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Completed integrations, one [`IntegrationOutput`] per cycle.
    pub fn outputs(&self) -> &Receiver<IntegrationOutput> {
        &self.outputs
    }

    pub fn start_integration(&self, seconds: f64) -> Result<(), CycleError> {
        lock(&self.engine).start_integration(seconds, self.clock.now())
    }

    pub fn abort_integration(&self) -> bool {
        lock(&self.engine).abort_integration()
    }

    pub fn integration_left(&self) -> Option<f64> {
        lock(&self.engine).integration_left(self.clock.now())
    }

    pub fn is_integrating(&self) -> bool {
        lock(&self.engine).cycle().is_integrating()
    }

    /// Statistics since the last report; call once per reporting period.
    pub fn report(&self) -> Report {
        lock(&self.engine).report(self.settings.reporting_period, self.clock.now())
    }

    /// Run `f` against the engine, e.g. to inspect the live buffers.
    pub fn with_engine<R>(&self, f: impl FnOnce(&Correlator) -> R) -> R {
        f(&lock(&self.engine))
    }

    fn check_line(&self, line: usize) -> Result<(), ConfigError> {
        if line < self.info.num_lines {
            Ok(())
        } else {
            Err(ConfigError::NoSuchLine {
                line,
                num_lines: self.info.num_lines,
            })
        }
    }

    fn queue(&self, change: ConfigChange) {
        debug!("Queueing {change:?}");
        if self.changes.send(change).is_err() {
            warn!("The packet reader has gone away; configuration change dropped");
        }
    }

    pub fn set_line_location(&self, line: usize, position: ENH) -> Result<(), ConfigError> {
        self.check_line(line)?;
        validate_position(position)?;
        self.queue(ConfigChange::LinePosition { line, position });
        Ok(())
    }

    pub fn set_line_flags(&self, line: usize, flags: LineFlags) -> Result<(), ConfigError> {
        self.check_line(line)?;
        self.queue(ConfigChange::LineFlags { line, flags });
        Ok(())
    }

    pub fn set_settings(&mut self, settings: Settings) -> Result<(), ConfigError> {
        settings.validate()?;
        self.settings = settings.clone();
        self.queue(ConfigChange::Settings(settings));
        Ok(())
    }

    /// Set wavelength and bandwidth from a frequency band \[Hz\].
    pub fn set_frequency_band(&mut self, low: f64, high: f64) -> Result<(), ConfigError> {
        let settings = self.settings.with_frequency_band(low, high)?;
        self.set_settings(settings)
    }

    pub fn set_target(&self, target: RADec) -> Result<(), ConfigError> {
        let observation = Observation {
            target,
            ..*lock(&self.engine).observation()
        };
        observation.validate()?;
        self.queue(ConfigChange::Target(target));
        Ok(())
    }

    /// Stop the packet reader, switch every line off and disable capture.
    /// Returns the transport, unless the reader thread panicked.
    pub fn disconnect(mut self) -> Option<T> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<T> {
        let handle = self.reader.take()?;
        self.stop.store(true);
        let mut transport = match handle.join() {
            Ok(transport) => transport,
            Err(_) => {
                warn!("The packet reader panicked");
                return None;
            }
        };
        for line in 0..self.info.num_lines {
            if let Err(e) = transport.set_line_flags(line, 0) {
                warn!("Couldn't switch off line {line}: {e}");
            }
        }
        if let Err(e) = transport.set_capture(false) {
            warn!("Couldn't disable capture: {e}");
        }
        info!("Disconnected");
        Some(transport)
    }
}

impl<T: Transport + 'static> Drop for Device<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use hifitime::Duration;
    use marlu::LatLngHeight;

    use super::*;
    use crate::{hardware::sim::SimulatedCorrelator, reader::SystemClock, write::FitsEncoder};

    fn observation() -> Observation {
        Observation {
            site: LatLngHeight {
                longitude_rad: 2.0,
                latitude_rad: -0.47,
                height_metres: 377.0,
            },
            target: RADec::from_degrees(0.0, -27.0),
            dut1: Duration::from_seconds(0.0),
        }
    }

    fn connect(sim: SimulatedCorrelator) -> Result<Device<SimulatedCorrelator>, ConnectError> {
        Device::connect(
            sim,
            Settings::default(),
            observation(),
            FitsEncoder::new(std::env::temp_dir()),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn undetected_hardware_fails_to_connect() {
        let mut sim = SimulatedCorrelator::new(3, StdDuration::from_millis(10));
        sim.disconnect();
        assert!(matches!(connect(sim), Err(ConnectError::NotDetected)));
    }

    #[test]
    fn configuration_is_validated_before_queueing() {
        let mut device = connect(SimulatedCorrelator::new(3, StdDuration::from_millis(10))).unwrap();
        assert!(matches!(
            device.set_line_location(3, ENH::default()),
            Err(ConfigError::NoSuchLine { line: 3, num_lines: 3 })
        ));
        let nowhere = ENH {
            e: f64::NAN,
            n: 0.0,
            h: 0.0,
        };
        assert!(device.set_line_location(0, nowhere).is_err());
        assert!(device.set_frequency_band(5e6, 1e6).is_err());
        assert!(device.set_target(RADec::from_degrees(0.0, 95.0)).is_err());

        device.set_frequency_band(1e6, 2e6).unwrap();
        let (low, high) = device.settings().frequency_band();
        approx::assert_abs_diff_eq!(low, 1e6, epsilon = 1e-3);
        approx::assert_abs_diff_eq!(high, 2e6, epsilon = 1e-3);
    }

    #[test]
    fn disconnect_switches_lines_off() {
        let device = connect(SimulatedCorrelator::new(3, StdDuration::from_millis(5))).unwrap();
        device.set_line_flags(2, LineFlags::enabled()).unwrap();
        device.start_integration(60.0).unwrap();
        assert!(device.is_integrating());
        assert!(device.start_integration(1.0).is_err());
        let mut sim = device.disconnect().unwrap();
        assert_eq!(sim.line_flags, vec![0, 0, 0]);
        // Capture is off again.
        assert!(sim.get_packet().unwrap().is_none());
    }
}
