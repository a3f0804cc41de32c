use chrono::Local;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{LevelFilter, error, info, warn};
use rusty_pmac::config::load_config_or_default;
use rusty_pmac::gather::write_delimited;
use rusty_pmac::pmac::RunOptions;
use rusty_pmac::{
    AppConfig, Comm, CoordMap, CoordOptions, GatherClient, GatherConfig, PmacError,
    SshConnector, Undefine, gather,
};
use std::{
    fs::{self, File},
    io::{self, BufRead, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// Power PMAC command line client
#[derive(Parser, Debug)]
#[command(name = "pmac")]
#[command(about = "Talk to a Power PMAC motion controller over SSH", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the controller address
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read one or more variables
    Get { names: Vec<String> },
    /// Write a variable
    Set {
        name: String,
        value: String,
        /// Read the value back afterwards
        #[arg(long)]
        check: bool,
    },
    /// Show or apply motor to coordinate system assignments
    Coords {
        /// Print as JSON
        #[arg(long)]
        json: bool,
        /// Apply assignments from a JSON file ({"coord": {"motor": "axis"}})
        #[arg(long, value_name = "FILE")]
        apply: Option<PathBuf>,
        /// Undefine every coordinate system before applying
        #[arg(long)]
        undefine_all: bool,
    },
    /// Kill motors
    Kill { motors: Vec<u32> },
    /// Run a motion program and wait for it to finish
    Run {
        coord: u32,
        program: u32,
        /// Variables to report while the program runs
        #[arg(short, long)]
        watch: Vec<String>,
    },
    /// Gather addresses at servo rate
    Gather {
        addresses: Vec<String>,
        /// Servo cycles per sample
        #[arg(short, long, default_value_t = 1)]
        period: u32,
        /// Seconds to gather
        #[arg(short, long, default_value_t = 1.0)]
        duration: f64,
        /// Sample count, overrides --duration
        #[arg(short, long)]
        samples: Option<u64>,
        /// Directory for the output file
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Read the current gather buffer from the fast gather server
    FastGather {
        /// Read phase-rate data instead of servo-rate
        #[arg(long)]
        phase: bool,
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Interactive interpreter prompt
    Repl,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = load_config_or_default(args.config.as_deref());
    if let Some(host) = &args.host {
        config.connection.host = host.clone();
    }

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level);

    let cancel = setup_cancel_handler()?;

    if let Command::FastGather { phase, output } = &args.command {
        return fast_gather(&config, *phase, output);
    }

    info!(
        "Connecting to {}@{}:{}",
        config.connection.username, config.connection.host, config.connection.port
    );
    let connector = SshConnector::connect(&config.connection)?;
    let mut comm = Comm::new(connector, &config)?;

    match args.command {
        Command::Get { names } => {
            let values = comm.gpascii().lock().get_variables(&names)?;
            for (name, value) in names.iter().zip(values) {
                println!("{name}={value}");
            }
        }
        Command::Set { name, value, check } => {
            let read_back = comm.gpascii().lock().set_variable(&name, &value, check)?;
            if let Some(read_back) = read_back {
                println!("{name}={read_back}");
            }
        }
        Command::Coords {
            json,
            apply,
            undefine_all,
        } => {
            let shared = comm.gpascii();
            let mut gp = shared.lock();
            if let Some(path) = apply {
                let coords: CoordMap = serde_json::from_str(&fs::read_to_string(&path)?)?;
                let options = CoordOptions {
                    undefine: if undefine_all {
                        Undefine::All
                    } else {
                        Undefine::Touched
                    },
                    ..Default::default()
                };
                gp.set_coords(&coords, options)?;
                info!("Applied coordinate systems from {}", path.display());
            }
            print_coords(&gp.get_coords()?, json)?;
        }
        Command::Kill { motors } => {
            comm.gpascii().lock().kill_motors(&motors)?;
            info!("Killed motors {:?}", motors);
        }
        Command::Run {
            coord,
            program,
            watch,
        } => {
            let options = RunOptions {
                variables: watch,
                cancel: Some(cancel.as_ref()),
                poll_interval: None,
            };
            let outcome = comm
                .gpascii()
                .lock()
                .run_and_wait(coord, program, &options, |change| {
                    println!("{}: {} -> {}", change.name, change.previous, change.value);
                })?;
            if outcome.is_ok() {
                info!("Program {} finished", program);
            } else {
                error!(
                    "Program {} finished with status {} ({})",
                    program,
                    outcome.error_status,
                    outcome.description.as_deref().unwrap_or("unknown")
                );
            }
        }
        Command::Gather {
            addresses,
            period,
            duration,
            samples,
            output,
        } => {
            let mut gather_config =
                GatherConfig::new(addresses, period, duration).with_paths(config.gather.clone());
            if let Some(samples) = samples {
                gather_config = gather_config.with_samples(samples);
            }
            let outcome = gather(&mut comm, &gather_config, Some(cancel.as_ref()))?;
            let path = write_gather_file(&output, &outcome.addresses, &outcome.rows)?;
            info!("Wrote {} rows to {}", outcome.rows.nrows(), path.display());
        }
        Command::Repl => repl(&comm, &cancel)?,
        Command::FastGather { .. } => {}
    }

    Ok(())
}

fn print_coords(coords: &CoordMap, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(coords)?);
        return Ok(());
    }

    if coords.is_empty() {
        println!("No motors assigned");
    }
    for (coord, motor, axis) in coords.assignments() {
        println!("&{coord} #{motor}->{axis}");
    }
    Ok(())
}

fn fast_gather(
    config: &AppConfig,
    phase: bool,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = GatherClient::builder()
        .address(&config.connection.host)
        .port(config.connection.fast_gather_port)
        .connect_timeout(config.connection.connect_timeout())
        .read_timeout(Duration::from_secs(30))
        .build()?;

    if phase {
        client.set_phase_mode()?;
    } else {
        client.set_servo_mode()?;
    }

    let data = client.query_all()?;
    let header: Vec<String> = data.types.iter().map(|t| format!("{t:?}")).collect();
    let path = write_gather_file(output, &header, &data.columns.reversed_axes())?;
    info!("Wrote {} samples to {}", data.samples, path.display());
    Ok(())
}

fn write_gather_file(
    dir: &Path,
    addresses: &[String],
    rows: &ndarray::Array2<f64>,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("gather_{}.txt", Local::now().format("%Y%m%d_%H%M%S")));
    let mut out = BufWriter::new(File::create(&path)?);
    write_delimited(&mut out, addresses, rows, "\t")?;
    out.flush()?;
    Ok(path)
}

/// Send each stdin line to the interpreter and print what comes back
fn repl(
    comm: &Comm<SshConnector>,
    cancel: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let shared = comm.gpascii();
    let stdin = io::stdin();
    println!("Connected. Empty line or Ctrl+D to quit.");

    for line in stdin.lock().lines() {
        if cancel.swap(false, Ordering::SeqCst) {
            warn!("Interrupt ignored at the prompt");
        }
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }

        let mut gp = shared.lock();
        let result = gp.send_line(line).and_then(|_| gp.sync());
        match result {
            Ok(lines) => lines.iter().for_each(|l| println!("{l}")),
            Err(PmacError::Interpreter(message)) => println!("{message}"),
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    Ok(())
}

/// Setup Ctrl+C handler that cancels long running waits
fn setup_cancel_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_clone = cancel.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping...");
        cancel_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(cancel)
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}
