use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration as StdDuration,
};

use clap::{AppSettings, Parser};
use crossbeam_channel::RecvTimeoutError;
use hifitime::Duration;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use marlu::{LatLngHeight, RADec, ENH};

use xcorr::{
    config::{DEFAULT_BANDWIDTH, DEFAULT_PLOT_SIZE, DEFAULT_WAVELENGTH},
    hardware::sim::SimulatedCorrelator,
    stats::Report,
    Device, FitsEncoder, ImageEncoder, IntegrationOutput, LineFlags, Observation, Settings,
    SystemClock, XcError,
};

#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// A line position as east,north,height \[metres\]. Give one per line.
    #[clap(
        short,
        long = "line",
        required = true,
        allow_hyphen_values = true,
        parse(try_from_str = parse_enh)
    )]
    lines: Vec<ENH>,

    /// Target right ascension \[degrees\].
    #[clap(long, default_value = "83.63308", allow_hyphen_values = true)]
    ra: f64,

    /// Target declination \[degrees\].
    #[clap(long, default_value = "22.0145", allow_hyphen_values = true)]
    dec: f64,

    /// Array latitude \[degrees\].
    #[clap(long, default_value = "-26.70331940", allow_hyphen_values = true)]
    latitude: f64,

    /// Array longitude \[degrees\].
    #[clap(long, default_value = "116.67081524", allow_hyphen_values = true)]
    longitude: f64,

    /// How long to integrate for \[seconds\].
    #[clap(short, long, default_value = "10")]
    duration: f64,

    /// Observing wavelength \[metres\].
    #[clap(long)]
    wavelength: Option<f64>,

    /// Filter bandwidth, expressed as a wavelength \[metres\].
    #[clap(long)]
    bandwidth: Option<f64>,

    /// Side of the preview image \[pixels\].
    #[clap(long, default_value_t = DEFAULT_PLOT_SIZE)]
    plot_size: usize,

    /// How often the simulated correlator produces a packet \[milliseconds\].
    #[clap(long, default_value = "100")]
    packet_period_ms: u64,

    /// Where the image blocks are written.
    #[clap(short, long, default_value = ".")]
    output: PathBuf,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,

    /// Disable progress bars.
    #[clap(long)]
    no_progress_bars: bool,
}

fn parse_enh(s: &str) -> Result<ENH, String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("'{p}': {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        &[e, n, h] => Ok(ENH { e, n, h }),
        _ => Err(format!("expected e,n,h but got '{s}'")),
    }
}

fn main() {
    if let Err(e) = try_main() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), XcError> {
    let args = Args::parse();
    setup_logging(args.verbosity);

    let settings = Settings {
        wavelength: args.wavelength.unwrap_or(DEFAULT_WAVELENGTH),
        bandwidth: args.bandwidth.unwrap_or(DEFAULT_BANDWIDTH),
        plot_size: args.plot_size,
        ..Settings::default()
    };
    let observation = Observation {
        site: LatLngHeight {
            longitude_rad: args.longitude.to_radians(),
            latitude_rad: args.latitude.to_radians(),
            height_metres: 0.0,
        },
        target: RADec::from_degrees(args.ra, args.dec),
        dut1: Duration::from_seconds(0.0),
    };
    let reporting_period = settings.reporting_period;

    let sim = SimulatedCorrelator::new(
        args.lines.len(),
        StdDuration::from_millis(args.packet_period_ms),
    );
    let encoder = FitsEncoder::new(std::env::temp_dir());
    let extension = encoder.extension();
    let device = Device::connect(sim, settings, observation, encoder, Arc::new(SystemClock))?;

    for (line, &position) in args.lines.iter().enumerate() {
        device.set_line_location(line, position)?;
        device.set_line_flags(line, LineFlags::enabled())?;
    }
    fs::create_dir_all(&args.output)?;

    let progress = ProgressBar::with_draw_target(
        Some((args.duration * 1000.0).ceil() as u64),
        if args.no_progress_bars {
            ProgressDrawTarget::hidden()
        } else {
            ProgressDrawTarget::stdout()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg:17}: [{wide_bar:.blue}] {elapsed_precise}<{eta_precise}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    )
    .with_message("Integrating");

    device.start_integration(args.duration)?;
    let output = loop {
        match device.outputs().recv_timeout(reporting_period) {
            Ok(output) => break Some(output),
            Err(RecvTimeoutError::Timeout) => {
                let report = device.report();
                log_report(&report);
                if let Some(left) = report.integration_left {
                    progress.set_position(((args.duration - left) * 1000.0) as u64);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("The packet reader stopped before the integration completed");
                break None;
            }
        }
    };
    progress.finish_and_clear();

    if let Some(output) = output {
        write_blocks(&output, &args.output, extension)?;
    }
    device.disconnect();
    Ok(())
}

fn log_report(report: &Report) {
    for line in report.lines.iter().filter(|l| l.enabled) {
        debug!(
            "Line {:02}: delay {:.3e} s, {:.1} counts/s, flux {:.3e} lm, magnitude {}",
            line.line + 1,
            line.delay_s,
            line.counts_per_second,
            line.flux,
            line.magnitude.map_or_else(|| "-".to_string(), |m| format!("{m:.2}"))
        );
    }
    for c in &report.correlations {
        debug!(
            "Lines {:02}*{:02}: {:.1} correlations/s, coherence {:.4}",
            c.first + 1,
            c.second + 1,
            c.correlations_per_second,
            c.coherence
        );
    }
}

fn write_blocks(output: &IntegrationOutput, dir: &Path, extension: &str) -> Result<(), XcError> {
    if output.failed > 0 {
        warn!("{} of {} blocks failed to encode", output.failed, output.attempted);
    }
    for block in output.blocks() {
        let path = dir.join(format!("{}.{extension}", block.name));
        fs::write(&path, &block.data)?;
        info!("Wrote {} ({}x{})", path.display(), block.dims.0, block.dims.1);
    }
    Ok(())
}

fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.init();
}
