//! The background packet reader.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration as StdDuration, SystemTime, UNIX_EPOCH},
};

use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::atomic::AtomicCell;
use hifitime::Epoch;
use log::{debug, trace, warn};

use crate::{
    config::ConfigChange,
    correlator::{lock, Command, Correlator},
    hardware::Transport,
    write::{FrozenCycle, ImageEncoder, IntegrationOutput, Serializer},
};

/// How long to wait before looking at a disconnected correlator again.
pub const DISCONNECTED_BACKOFF: StdDuration = StdDuration::from_millis(100);

/// Where "now" comes from.
pub trait Clock: Send + Sync {
    fn now(&self) -> Epoch;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Epoch {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Epoch::from_unix_seconds(since_epoch.as_secs_f64())
    }
}

/// What one pass of the reader loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Disconnected,

    /// No packet was ready; no tick was consumed.
    NotReady,

    /// One packet was consumed. `finalized` is set if an integration was
    /// completed and its output sent.
    Tick { finalized: bool },
}

pub struct PacketReader<T, E> {
    transport: T,
    engine: Arc<Mutex<Correlator>>,
    changes: Receiver<ConfigChange>,
    outputs: Sender<IntegrationOutput>,
    serializer: Serializer<E>,
    clock: Arc<dyn Clock>,
}

impl<T: Transport, E: ImageEncoder> PacketReader<T, E> {
    pub fn new(
        transport: T,
        engine: Arc<Mutex<Correlator>>,
        changes: Receiver<ConfigChange>,
        outputs: Sender<IntegrationOutput>,
        encoder: E,
        clock: Arc<dyn Clock>,
    ) -> PacketReader<T, E> {
        PacketReader {
            transport,
            engine,
            changes,
            outputs,
            serializer: Serializer::new(encoder),
            clock,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// One pass of the loop: apply queued configuration, then consume at
    /// most one packet. Never sleeps.
    pub fn step(&mut self) -> Step {
        let commands: Vec<Command> = {
            let mut engine = lock(&self.engine);
            self.changes
                .try_iter()
                .filter_map(|change| engine.apply(change))
                .collect()
        };
        self.program(&commands);

        if !self.transport.is_connected() {
            return Step::Disconnected;
        }

        let packet = match self.transport.get_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                trace!("No packet ready");
                // A cycle can still run out while the hardware is quiet.
                let finished = lock(&self.engine).finalize_if_due(self.clock.now());
                if let Some(frozen) = finished {
                    self.finish(frozen);
                }
                return Step::NotReady;
            }
            Err(e) => {
                debug!("Couldn't read a packet: {e}");
                return Step::NotReady;
            }
        };

        let now = self.clock.now();
        let outcome = lock(&self.engine).process_packet(&packet, now);
        self.program(&outcome.commands);

        let finalized = match outcome.finished {
            Some(frozen) => {
                self.finish(frozen);
                true
            }
            None => false,
        };
        Step::Tick { finalized }
    }

    /// Loop until `stop` is set, then hand the transport back.
    pub fn run(mut self, stop: &AtomicCell<bool>) -> T {
        debug!("Packet reader started");
        while !stop.load() {
            match self.step() {
                Step::Disconnected => thread::sleep(DISCONNECTED_BACKOFF),
                Step::NotReady => thread::sleep(self.transport.packet_period()),
                Step::Tick { .. } => (),
            }
        }
        debug!("Packet reader stopped");
        self.transport
    }

    fn program(&mut self, commands: &[Command]) {
        for &command in commands {
            let result = match command {
                Command::ChannelDelay { line, ticks } => {
                    self.transport.set_channel_delay(line, ticks)
                }
                Command::LineFlags { line, bits } => self.transport.set_line_flags(line, bits),
            };
            if let Err(e) = result {
                warn!("Couldn't apply {command:?}: {e}");
            }
        }
    }

    /// Serialize a detached cycle outside the engine lock, then let the
    /// engine go idle.
    fn finish(&mut self, frozen: FrozenCycle) {
        let output = self.serializer.serialize(&frozen);
        lock(&self.engine).finish_cycle();
        if self.outputs.send(output).is_err() {
            warn!("Nobody is listening for integration output; dropping it");
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;
    use hifitime::Duration;
    use marlu::{LatLngHeight, RADec};
    use ndarray::ArrayView2;

    use super::*;
    use crate::{
        config::{LineFlags, Observation, Settings},
        hardware::{sim::SimulatedCorrelator, HardwareInfo},
        write::{BlockMetadata, EncodeError},
    };

    struct FixedClock(Epoch);

    impl Clock for FixedClock {
        fn now(&self) -> Epoch {
            self.0
        }
    }

    struct NullEncoder;

    impl ImageEncoder for NullEncoder {
        fn extension(&self) -> &'static str {
            "bin"
        }

        fn encode(
            &self,
            _: ArrayView2<f64>,
            _: &BlockMetadata,
        ) -> Result<Vec<u8>, EncodeError> {
            Ok(vec![0])
        }
    }

    fn reader(
        sim: SimulatedCorrelator,
    ) -> (
        PacketReader<SimulatedCorrelator, NullEncoder>,
        crossbeam_channel::Sender<ConfigChange>,
        Receiver<IntegrationOutput>,
    ) {
        let info: HardwareInfo = sim.info();
        let observation = Observation {
            site: LatLngHeight {
                longitude_rad: 0.0,
                latitude_rad: -0.5,
                height_metres: 0.0,
            },
            target: RADec::from_degrees(0.0, -30.0),
            dut1: Duration::from_seconds(0.0),
        };
        let engine = Correlator::new(info, Settings::default(), observation).unwrap();
        let (change_tx, change_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let clock = Arc::new(FixedClock(Epoch::from_gpst_seconds(1_300_000_000.0)));
        let reader = PacketReader::new(
            sim,
            Arc::new(Mutex::new(engine)),
            change_rx,
            out_tx,
            NullEncoder,
            clock,
        );
        (reader, change_tx, out_rx)
    }

    #[test]
    fn queued_flags_reach_the_hardware_at_the_next_step() {
        let (mut reader, changes, _) = reader(SimulatedCorrelator::new(2, StdDuration::ZERO));
        changes
            .send(ConfigChange::LineFlags {
                line: 1,
                flags: LineFlags::enabled(),
            })
            .unwrap();
        assert_eq!(reader.transport().line_flags, vec![0, 0]);
        // Capture is off, so there is nothing to read.
        assert_eq!(reader.step(), Step::NotReady);
        // Waiting for a packet doesn't use up a tick.
        assert_eq!(lock(&reader.engine).ticks(), 0);
        assert_eq!(reader.transport().line_flags, vec![0, 1]);
        assert!(lock(&reader.engine).array().lines()[1].is_enabled());
    }

    #[test]
    fn disconnected_hardware_is_not_polled() {
        let mut sim = SimulatedCorrelator::new(2, StdDuration::ZERO);
        sim.disconnect();
        let (mut reader, _, _) = reader(sim);
        assert_eq!(reader.step(), Step::Disconnected);
        assert_eq!(lock(&reader.engine).ticks(), 0);
    }

    #[test]
    fn every_step_consumes_one_packet() {
        let (mut reader, _, _) = reader(SimulatedCorrelator::new(3, StdDuration::ZERO));
        reader.transport_mut().set_capture(true).unwrap();
        for _ in 0..4 {
            assert_eq!(reader.step(), Step::Tick { finalized: false });
        }
        assert_eq!(lock(&reader.engine).ticks(), 4);
    }

    #[test]
    fn run_returns_the_transport_once_stopped() {
        let (reader, _, _) = reader(SimulatedCorrelator::new(2, StdDuration::ZERO));
        let stop = AtomicCell::new(true);
        let sim = reader.run(&stop);
        assert_eq!(sim.line_count(), 2);
    }
}
