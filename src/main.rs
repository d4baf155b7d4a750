use std::process::exit;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use _core::logging::init_rust_logging;
use _core::{
    calculate_valid_impedance_range, generate_electrode_combinations, CurrentRange, FeChannel,
    FeMode, FrequencyScale, InjectionType, Isx3, SerialSettings, SetupRequest, SweepWorker,
    Repeat, TimeStampMode, WorkerCommand, WorkerEvent, DEFAULT_BAUD_RATE,
};

#[derive(Parser, Debug)]
#[command(name = "isx3-demo", about = "Configure an ISX-3 and run impedance sweeps")]
struct Args {
    /// Serial port (e.g. /dev/ttyUSB0 or COM3)
    port: String,
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
    #[arg(long, default_value_t = 1e3)]
    fmin: f32,
    #[arg(long, default_value_t = 1e6)]
    fmax: f32,
    #[arg(long, default_value_t = 13)]
    fnum: u16,
    /// linear | log
    #[arg(long, default_value = "log")]
    scale: FrequencyScale,
    /// 2pt | 3pt | 4pt
    #[arg(long, default_value = "4pt")]
    mode: FeMode,
    /// bnc | extport | mux
    #[arg(long, default_value = "bnc")]
    channel: FeChannel,
    /// auto | 10ma | 100ua | 1ua | 10na
    #[arg(long, default_value = "10ma")]
    range: CurrentRange,
    /// voltage | current
    #[arg(long, default_value = "voltage")]
    excitation: InjectionType,
    #[arg(long, default_value_t = 0.5)]
    amplitude: f32,
    #[arg(long, default_value_t = 1.0)]
    precision: f32,
    /// Electrode combination such as 1,2,3,4; repeat for several
    #[arg(short = 'c', long = "combination", value_parser = parse_combination)]
    combinations: Vec<[u8; 4]>,
    /// Measure every 4-electrode combination of these electrodes instead
    #[arg(long, value_delimiter = ',')]
    electrodes: Vec<u8>,
    /// off | ms | us
    #[arg(long, default_value = "off")]
    timestamp: TimeStampMode,
    #[arg(long, default_value_t = 1)]
    sweeps: u32,
    /// Keep sweeping for this long instead of a fixed count
    #[arg(long)]
    duration_ms: Option<u64>,
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,
}

fn parse_combination(s: &str) -> std::result::Result<[u8; 4], String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<u8>().map_err(|e| format!("'{v}': {e}")))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    <[u8; 4]>::try_from(values.as_slice())
        .map_err(|_| format!("expected 4 electrodes, got {}", values.len()))
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    init_rust_logging();
    let args = Args::parse();

    let window = calculate_valid_impedance_range(
        args.excitation,
        f64::from(args.amplitude),
        args.range,
    )
    .context("excitation outside device limits")?;
    println!(
        "Valid impedance window: {:.3} .. {:.3} ohm",
        window.z_min, window.z_max
    );

    let combinations = match (args.combinations.is_empty(), args.electrodes.is_empty()) {
        (false, true) => args.combinations.clone(),
        (true, false) => generate_electrode_combinations(&args.electrodes, true),
        (true, true) => vec![[1, 2, 3, 4]],
        (false, false) => bail!("use either --combination or --electrodes, not both"),
    };
    let request = SetupRequest {
        fmin: args.fmin,
        fmax: args.fmax,
        fnum: args.fnum,
        scale: args.scale,
        channel: args.channel,
        mode: args.mode,
        range: args.range,
        precision: args.precision,
        excitation: args.excitation,
        amplitude: args.amplitude,
        combinations,
        timestamp: args.timestamp,
        report_current_range: true,
    };

    let settings = SerialSettings {
        path: args.port.clone(),
        baud_rate: args.baud,
        ..Default::default()
    };
    println!("--- Connecting to {} ---", settings.path);
    let mut device = Isx3::connect_serial(&settings)
        .with_context(|| format!("opening {}", settings.path))?;

    match device.get_device_id() {
        Ok(id) => println!(
            "Device {} serial {} (delivered {})",
            id.device_id, id.serial_number, id.delivery_year
        ),
        Err(e) => println!("Device id: unknown ({e})"),
    }

    let worker = SweepWorker::spawn(device);
    worker.send(WorkerCommand::Configure(request))?;
    let repeat = match args.duration_ms {
        Some(ms) => Repeat::For(Duration::from_millis(ms)),
        None => Repeat::Count(args.sweeps),
    };
    worker.send(WorkerCommand::Sweep {
        first_index: 0,
        repeat,
        interval: Duration::from_millis(args.interval_ms),
    })?;

    let mut configured = false;
    loop {
        match worker.events().recv()? {
            WorkerEvent::Configured => {
                configured = true;
                println!("Configured, sweeping...");
            }
            WorkerEvent::Record {
                measurement_index,
                record,
            } => println!(
                "[{measurement_index}] comb {:3} freq {:3}: {:>12.4} {:+12.4}j  warn {} range {}",
                record.combination_index,
                record.frequency_index,
                record.real,
                record.imag,
                record.warning_code,
                record
                    .current_range
                    .map_or_else(|| "-".to_string(), |r| r.to_string()),
            ),
            WorkerEvent::SweepFinished {
                measurement_index,
                result,
                frequencies,
                ..
            } => {
                println!(
                    "Sweep {measurement_index} done: {} x {} points, {} warning(s)",
                    result.combinations(),
                    result.frequencies(),
                    result.warnings().len()
                );
                println!("Frequencies (Hz): {frequencies:?}");
            }
            WorkerEvent::Completed { next_index } => {
                println!("{next_index} sweep(s) completed");
                break;
            }
            WorkerEvent::Failed(e) => {
                let stage = if configured { "sweep" } else { "setup" };
                return Err(e).context(format!("{stage} failed"));
            }
            other => println!("{other:?}"),
        }
    }

    worker.shutdown()?;
    println!("Done.");
    Ok(())
}
