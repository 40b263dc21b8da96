use std::{
    sync::{Arc, Mutex},
    time::Duration as StdDuration,
};

use crossbeam_channel::unbounded;
use crossbeam_utils::atomic::AtomicCell;
use hifitime::{Duration, Epoch};
use marlu::{LatLngHeight, RADec, ENH};

use xcorr::{
    correlator::lock,
    cycle::CycleError,
    delay::DelayCompensator,
    hardware::{sim::SimulatedCorrelator, Correlation, LagVector, TransportError},
    Clock, ConfigChange, CorrelationPacket, Correlator, Device, FitsEncoder, LineFlags, Observation,
    PacketReader, Settings, Step, SystemClock, Transport,
};

const PACKET_PERIOD: f64 = 0.1;

/// A clock that only moves when told to.
struct ManualClock {
    base: Epoch,
    offset: AtomicCell<f64>,
}

impl ManualClock {
    fn new() -> ManualClock {
        ManualClock {
            base: Epoch::from_gpst_seconds(1_300_000_000.0),
            offset: AtomicCell::new(0.0),
        }
    }

    fn advance(&self, seconds: f64) {
        self.offset.store(self.offset.load() + seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Epoch {
        self.base + Duration::from_seconds(self.offset.load())
    }
}

/// Hands out a packet whenever asked and records what gets programmed.
struct ScriptedTransport {
    num_lines: usize,
    ready: bool,
    faulty: bool,
    delays: Vec<Vec<(usize, u32)>>,
    flags: Vec<u8>,
}

impl ScriptedTransport {
    fn new(num_lines: usize) -> ScriptedTransport {
        ScriptedTransport {
            num_lines,
            ready: true,
            faulty: false,
            delays: vec![],
            flags: vec![0; num_lines],
        }
    }
}

fn lags(width: usize, counts: u64) -> LagVector {
    LagVector(
        (0..width)
            .map(|k| Correlation {
                magnitude: if k == width / 2 { counts as f64 / 2.0 } else { 1.0 },
                counts,
                phase: 0.0,
            })
            .collect(),
    )
}

impl Transport for ScriptedTransport {
    fn is_connected(&self) -> bool {
        true
    }

    fn is_detected(&mut self) -> bool {
        true
    }

    fn line_count(&self) -> usize {
        self.num_lines
    }

    fn baseline_count(&self) -> usize {
        self.num_lines * (self.num_lines - 1) / 2
    }

    fn autocorrelator_lag_size(&self) -> usize {
        4
    }

    fn crosscorrelator_lag_size(&self) -> usize {
        4
    }

    fn clock_frequency(&self) -> f64 {
        400.0e6
    }

    fn delayline_depth(&self) -> u32 {
        64
    }

    fn packet_period(&self) -> StdDuration {
        StdDuration::from_secs_f64(PACKET_PERIOD)
    }

    fn get_packet(&mut self) -> Result<Option<CorrelationPacket>, TransportError> {
        if self.faulty {
            return Err(TransportError::NotConnected);
        }
        if !self.ready {
            return Ok(None);
        }
        self.delays.push(vec![]);
        Ok(Some(CorrelationPacket {
            counts: vec![1000; self.num_lines],
            autocorrelations: vec![lags(4, 1000); self.num_lines],
            crosscorrelations: vec![lags(7, 500); self.baseline_count()],
        }))
    }

    fn set_channel_delay(&mut self, line: usize, ticks: u32) -> Result<(), TransportError> {
        if let Some(tick) = self.delays.last_mut() {
            tick.push((line, ticks));
        }
        Ok(())
    }

    fn set_line_flags(&mut self, line: usize, bits: u8) -> Result<(), TransportError> {
        let flags = self
            .flags
            .get_mut(line)
            .ok_or(TransportError::NoSuchLine(line))?;
        *flags = bits;
        Ok(())
    }

    fn set_capture(&mut self, _: bool) -> Result<(), TransportError> {
        Ok(())
    }
}

fn observation() -> Observation {
    Observation {
        site: LatLngHeight {
            longitude_rad: 116.67_f64.to_radians(),
            latitude_rad: -26.7_f64.to_radians(),
            height_metres: 377.0,
        },
        target: RADec::from_degrees(60.0, -30.0),
        dut1: Duration::from_seconds(0.0),
    }
}

const POSITIONS: [ENH; 3] = [
    ENH { e: 0.0, n: 0.0, h: 0.0 },
    ENH { e: 10.0, n: 0.0, h: 0.0 },
    ENH { e: 0.0, n: 10.0, h: 0.0 },
];

#[test]
fn three_line_integration_of_two_packets() {
    let transport = ScriptedTransport::new(3);
    let info = transport.info();
    let settings = Settings {
        wavelength: 0.211121449,
        ..Settings::default()
    };
    let engine = Arc::new(Mutex::new(
        Correlator::new(info, settings, observation()).unwrap(),
    ));
    let (changes, change_rx) = unbounded();
    let (output_tx, outputs) = unbounded();
    let clock = Arc::new(ManualClock::new());
    let scratch = tempfile::tempdir().unwrap();
    let mut reader = PacketReader::new(
        transport,
        Arc::clone(&engine),
        change_rx,
        output_tx,
        FitsEncoder::new(scratch.path()),
        clock.clone(),
    );

    for (line, position) in POSITIONS.into_iter().enumerate() {
        changes
            .send(ConfigChange::LinePosition { line, position })
            .unwrap();
        changes
            .send(ConfigChange::LineFlags {
                line,
                flags: LineFlags::enabled(),
            })
            .unwrap();
    }

    // An idle tick applies the configuration and compensates delays, but
    // doesn't collect anything.
    assert_eq!(reader.step(), Step::Tick { finalized: false });
    assert_eq!(reader.transport().flags, vec![1, 1, 1]);
    assert_eq!(reader.transport().delays[0].len(), 3);
    assert!(lock(&engine).accumulator().autocorrelations()[0].is_empty());

    // The reference is the line leading along the direction; it alone is
    // pinned to zero.
    let direction = lock(&engine).direction_at(clock.now());
    let expected = DelayCompensator::new(400.0e6, 64)
        .compute(&POSITIONS, &[true; 3], direction)
        .unwrap();
    let reference = lock(&engine).reference().unwrap();
    assert_eq!(reference, expected.reference);
    for &(line, ticks) in &reader.transport().delays[0] {
        if line == reference {
            assert_eq!(ticks, 0);
        } else {
            assert!(ticks <= 63);
        }
    }

    lock(&engine)
        .start_integration(2.0 * PACKET_PERIOD, clock.now())
        .unwrap();
    // Only one integration at a time.
    assert_eq!(
        lock(&engine).start_integration(5.0, clock.now()),
        Err(CycleError::Busy)
    );

    clock.advance(PACKET_PERIOD);
    assert_eq!(reader.step(), Step::Tick { finalized: false });
    {
        let engine = lock(&engine);
        assert!(engine
            .accumulator()
            .autocorrelations()
            .iter()
            .all(|b| b.rows() == 1));
        assert!(outputs.is_empty());
    }

    clock.advance(PACKET_PERIOD);
    assert_eq!(reader.step(), Step::Tick { finalized: true });

    let output = outputs.try_recv().unwrap();
    assert_eq!(output.attempted, 3 + 3 + 1);
    assert_eq!(output.failed, 0);
    assert_eq!(output.blocks().count(), 7);
    for block in output.autocorrelations.iter() {
        assert_eq!(block.as_ref().unwrap().dims, (2, 4));
    }
    for block in output.crosscorrelations.iter() {
        assert_eq!(block.as_ref().unwrap().dims, (2, 7));
    }
    let names: Vec<_> = output.blocks().map(|b| b.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "AUTOCORRELATIONS_01",
            "AUTOCORRELATIONS_02",
            "AUTOCORRELATIONS_03",
            "CROSSCORRELATIONS_01_02",
            "CROSSCORRELATIONS_01_03",
            "CROSSCORRELATIONS_02_03",
            "PLOT01",
        ]
    );
    assert_eq!(output.preview.as_ref().unwrap().dims, (512, 512));
    assert!(output.blocks().all(|b| b.data.starts_with(b"SIMPLE")));

    // Back to idle with empty buffers.
    let engine = lock(&engine);
    assert!(engine.cycle().is_idle());
    assert!(engine
        .accumulator()
        .autocorrelations()
        .iter()
        .chain(engine.accumulator().crosscorrelations())
        .all(|b| b.rows() == 0));
    assert_eq!(engine.accumulator().preview().view().sum(), 0.0);
}

#[test]
fn a_quiet_correlator_still_ends_the_integration() {
    let transport = ScriptedTransport::new(2);
    let engine = Arc::new(Mutex::new(
        Correlator::new(transport.info(), Settings::default(), observation()).unwrap(),
    ));
    let (_changes, change_rx) = unbounded();
    let (output_tx, outputs) = unbounded();
    let clock = Arc::new(ManualClock::new());
    let scratch = tempfile::tempdir().unwrap();
    let mut reader = PacketReader::new(
        transport,
        Arc::clone(&engine),
        change_rx,
        output_tx,
        FitsEncoder::new(scratch.path()),
        clock.clone(),
    );
    lock(&engine).start_integration(1.0, clock.now()).unwrap();

    reader.transport_mut().ready = false;
    clock.advance(1.5);
    assert_eq!(reader.step(), Step::NotReady);

    // Nothing was collected, so only the preview is attempted.
    let output = outputs.try_recv().unwrap();
    assert_eq!(output.attempted, 1);
    assert!(output.autocorrelations.iter().all(Option::is_none));
    assert!(output.preview.is_some());
    assert!(lock(&engine).cycle().is_idle());
}

#[test]
fn read_faults_are_retried_without_a_tick() {
    let transport = ScriptedTransport::new(2);
    let engine = Arc::new(Mutex::new(
        Correlator::new(transport.info(), Settings::default(), observation()).unwrap(),
    ));
    let (_changes, change_rx) = unbounded();
    let (output_tx, _outputs) = unbounded();
    let scratch = tempfile::tempdir().unwrap();
    let mut reader = PacketReader::new(
        transport,
        Arc::clone(&engine),
        change_rx,
        output_tx,
        FitsEncoder::new(scratch.path()),
        Arc::new(ManualClock::new()),
    );

    reader.transport_mut().faulty = true;
    for _ in 0..3 {
        assert_eq!(reader.step(), Step::NotReady);
    }
    assert_eq!(lock(&engine).ticks(), 0);

    reader.transport_mut().faulty = false;
    assert_eq!(reader.step(), Step::Tick { finalized: false });
    assert_eq!(lock(&engine).ticks(), 1);
}

#[test]
fn simulated_device_completes_an_integration() {
    let sim = SimulatedCorrelator::new(3, StdDuration::from_millis(10));
    let scratch = tempfile::tempdir().unwrap();
    let device = Device::connect(
        sim,
        Settings::default(),
        observation(),
        FitsEncoder::new(scratch.path()),
        Arc::new(SystemClock),
    )
    .unwrap();
    for (line, position) in POSITIONS.into_iter().enumerate() {
        device.set_line_location(line, position).unwrap();
        device.set_line_flags(line, LineFlags::enabled()).unwrap();
    }
    // Let the reader pick the configuration up before integrating.
    std::thread::sleep(StdDuration::from_millis(50));

    device.start_integration(0.2).unwrap();
    let output = device
        .outputs()
        .recv_timeout(StdDuration::from_secs(10))
        .unwrap();
    assert_eq!(output.failed, 0);
    assert_eq!(output.blocks().count(), 7);

    let rows: Vec<usize> = output
        .autocorrelations
        .iter()
        .chain(output.crosscorrelations.iter())
        .map(|b| b.as_ref().unwrap().dims.0)
        .collect();
    assert!(rows[0] > 0);
    assert!(rows.iter().all(|&r| r == rows[0]));

    let report = device.report();
    assert!(report.lines.iter().all(|l| l.enabled));
    assert_eq!(report.integration_left, None);

    let sim = device.disconnect().unwrap();
    assert_eq!(sim.line_flags, vec![0, 0, 0]);
}
