use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use log::{error, info, LevelFilter};
use rnpu_sweep::{
    keithley,
    simulated::{Journal, SimulatedChassis, SimulatedSmu},
    tui::Status,
    AbortedRun, DaqChassis, ExperimentConfig, MergedRun, RunDirectory, RunRecorder, SourceMeter,
    SyncOrchestrator,
};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{
    fs::File,
    io::{stdin, stdout, Write},
    path::{Path, PathBuf},
    thread,
};
use time::OffsetDateTime;

type Smu = Box<dyn SourceMeter + Send>;
type Chassis = Box<dyn DaqChassis + Send>;
type Recorders = Vec<Box<dyn RunRecorder + Send>>;

/// Synchronized SMU sweep with NI-DAQ readout
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Experiment configuration (YAML)
    config: PathBuf,

    /// Directory that receives one sub-directory per run
    #[arg(short, long, default_value = "results")]
    output_dir: PathBuf,

    /// Run against simulated instruments
    #[arg(long)]
    simulate: bool,

    /// Log to the terminal instead of showing the status view
    #[arg(long)]
    headless: bool,

    /// Skip the compliance confirmation prompt
    #[arg(short, long)]
    yes: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = ExperimentConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if !args.yes && !confirm(&config)? {
        println!("Experiment cancelled.");
        return Ok(());
    }

    let started = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let run_dir = RunDirectory::create(&args.output_dir, &config.name, started)?;
    init_logging(args.verbose, args.headless, &run_dir.log_path())?;
    info!("Configuration: {}", args.config.display());

    let (smu, daq) = open_instruments(&config, args.simulate)?;
    let orchestrator = SyncOrchestrator::new(config, smu, daq)?;
    let recorders = run_dir.recorders();

    let outcome = if args.headless {
        run_headless(orchestrator, recorders)
    } else {
        run_with_status(orchestrator, recorders)?
    };
    report(outcome, run_dir.path())
}

fn init_logging(verbose: u8, headless: bool, log_path: &Path) -> Result<()> {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let log_config = ConfigBuilder::new().set_time_format_rfc3339().build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![WriteLogger::new(
        level,
        log_config.clone(),
        File::create(log_path)?,
    )];
    // the status view owns the terminal otherwise
    if headless {
        loggers.push(TermLogger::new(
            level,
            log_config,
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

/// Operator check of the SMU protection limits before anything is switched on.
fn confirm(config: &ExperimentConfig) -> Result<bool> {
    let (voltage, current) = config.compliance();
    println!("Experiment: {}", config.name);
    println!(
        "SMU {} ({:?}), compliance {voltage} V / {current:e} A",
        config.smu.device_id, config.smu.drive_mode
    );
    println!(
        "Sweep {:e} .. {:e} in {} points ({:?})",
        config.min_value, config.max_value, config.ramp_points, config.sweep_shape
    );
    print!("Make sure the compliance settings are safe for the device. Continue? [y/N] ");
    stdout().flush()?;

    let mut answer = String::new();
    stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn open_instruments(config: &ExperimentConfig, simulate: bool) -> Result<(Smu, Chassis)> {
    if simulate {
        info!("Using simulated instruments");
        let journal = Journal::default();
        let smu = SimulatedSmu::new(journal.clone()).with_noise(config.tolerance() / 10.0);
        let daq = SimulatedChassis::new(journal).with_noise(1e-3);
        return Ok((Box::new(smu), Box::new(daq)));
    }

    let smu = keithley::connect(&config.smu.device_id, config.smu.timeout())
        .with_context(|| format!("connecting to SMU {}", config.smu.device_id))?;
    Ok((smu, open_chassis()?))
}

#[cfg(feature = "nidaqmx")]
fn open_chassis() -> Result<Chassis> {
    Ok(Box::new(rnpu_sweep::NiChassis::new()))
}

#[cfg(not(feature = "nidaqmx"))]
fn open_chassis() -> Result<Chassis> {
    Err(anyhow!(
        "built without the nidaqmx feature; rebuild with --features nidaqmx or pass --simulate"
    ))
}

fn run_headless(
    mut orchestrator: SyncOrchestrator<Smu, Chassis>,
    mut recorders: Recorders,
) -> Result<MergedRun, AbortedRun> {
    orchestrator.run(&mut recorders)
}

/// Sweep on a worker thread while the status view renders progress.
fn run_with_status(
    orchestrator: SyncOrchestrator<Smu, Chassis>,
    mut recorders: Recorders,
) -> Result<Result<MergedRun, AbortedRun>> {
    let (tx, rx) = unbounded();
    let cancel = orchestrator.cancel_token();
    let mut status = Status::new(orchestrator.config(), cancel.clone());
    let mut orchestrator = orchestrator.with_progress(tx);

    let worker = thread::spawn(move || orchestrator.run(&mut recorders));

    let mut terminal = ratatui::init();
    let ui = status.run(&mut terminal, rx);
    ratatui::restore();

    if let Err(e) = &ui {
        error!("Status view failed: {e}");
        cancel.cancel();
    }
    let outcome = worker
        .join()
        .map_err(|_| anyhow!("sweep thread panicked"))?;
    ui?;
    Ok(outcome)
}

fn report(outcome: Result<MergedRun, AbortedRun>, dir: &Path) -> Result<()> {
    match outcome {
        Ok(run) => {
            println!(
                "Measured {} points, saved to {}",
                run.len(),
                dir.display()
            );
            Ok(())
        }
        Err(aborted) => {
            println!(
                "Partial data ({} points) saved to {}",
                aborted.partial.len(),
                dir.display()
            );
            Err(aborted.into())
        }
    }
}
