use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use rbdiscipline::config::Config;
use rbdiscipline::control::ControlLoop;
use rbdiscipline::eeprom::{FileEepromBackend, ParameterStore};
use rbdiscipline::engine::ReferenceEngine;
use rbdiscipline::gnss::framer::LineFramer;
use rbdiscipline::gnss::GnssReference;
use rbdiscipline::oscillator;
use rbdiscipline::phasemeter::Phasemeter;
use rbdiscipline::phc::{LinuxPhc, PhcClock};
use rbdiscipline::status::SharedStatusSink;
use std::fs::File;
use std::io::BufReader;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SINGLETON_LOCK_PATH: &str = "/var/run/rbdiscipline.lock";

#[derive(Parser, Debug)]
#[command(name = "rbdisciplined", about = "Disciplines a rubidium oscillator against a GNSS reference")]
struct Args {
    #[arg(long, default_value = "/etc/rbdiscipline/rbdiscipline.conf")]
    config: PathBuf,

    #[arg(long)]
    foreground: bool,

    #[arg(short = 'v', long)]
    verbose: bool,
}

fn init_logger(args: &Args) {
    let mut builder = env_logger::Builder::from_default_env();
    if args.foreground {
        builder.format_timestamp(None).format_target(false);
    } else {
        builder.format_timestamp_millis().format_target(true);
    }
    let level = if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    builder.filter_level(level);
    builder.init();
}

/// Holds an advisory lock on the singleton file for the process lifetime;
/// dropping it (or exiting) releases the lock.
struct SingletonLock {
    _file: File,
}

fn acquire_singleton_lock(path: &str) -> std::io::Result<SingletonLock> {
    let file = std::fs::OpenOptions::new().create(true).write(true).open(path)?;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(SingletonLock { _file: file })
}

fn main() {
    let args = Args::parse();
    init_logger(&args);

    if let Err(e) = try_main(args) {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn try_main(args: Args) -> Result<()> {
    let _lock = acquire_singleton_lock(SINGLETON_LOCK_PATH)
        .with_context(|| format!("another instance is already running (lock held on {SINGLETON_LOCK_PATH})"))?;

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    run(config)
}

fn run(config: Config) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handler(shutdown.clone());

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Status("initializing")]);

    let mut driver = oscillator::build(&config)?;
    let has_internal_phase = driver.has_internal_phase_source();

    let phc: Box<dyn PhcClock> = Box::new(LinuxPhc::open(&config.ptp_clock)?);

    let phasemeter = if has_internal_phase {
        None
    } else {
        let extts_phc: Box<dyn PhcClock> = Box::new(LinuxPhc::open(&config.ptp_clock)?);
        Some(Phasemeter::start(extts_phc, shutdown.clone())?)
    };

    let gnss_path = config.get_raw("gnss-device").unwrap_or("/dev/ttyS0").to_string();
    let gnss_port = serialport::new(&gnss_path, 9_600)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| rbdiscipline::error::OscillatordError::DeviceAbsent {
            path: gnss_path,
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
    let framer = Box::new(LineFramer::new(BufReader::new(gnss_port)));
    let gnss = GnssReference::start(framer, shutdown.clone());

    let param_store_config_path = config.get_raw("eeprom-config-path").unwrap_or("/var/lib/rbdiscipline/dsc_config");
    let param_store_temp_path = config.get_raw("eeprom-temp-path").unwrap_or("/var/lib/rbdiscipline/temp_table");
    let backend = FileEepromBackend::new(param_store_config_path, param_store_temp_path);
    let mut param_store = ParameterStore::new(backend);
    let params = param_store.read().unwrap_or_default();

    if let Err(e) = driver.apply_disciplining_parameters(&params) {
        log::warn!("oscillator driver does not accept stored disciplining parameters: {e}");
    }

    let engine = Box::new(ReferenceEngine::new(config.engine_config(), params, driver.dac_min(), driver.dac_max()));
    let status_sink = Arc::new(SharedStatusSink::new());

    let mut control = ControlLoop::new(
        config,
        driver,
        phc,
        phasemeter,
        gnss,
        engine,
        status_sink,
        shutdown.clone(),
    );

    info!("performing initial alignment");
    control.initial_align()?;

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready, sd_notify::NotifyState::Status("tracking")]);
    info!("entering steady-state control loop");
    control.run()?;

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    info!("shutdown complete");
    Ok(())
}

fn install_signal_handler(shutdown: Arc<AtomicBool>) {
    let already_stopping = shutdown.clone();
    ctrlc::set_handler(move || {
        if already_stopping.swap(true, Ordering::SeqCst) {
            error!("second shutdown signal received, exiting immediately");
            std::process::exit(130);
        }
        info!("shutdown signal received, stopping control loop");
    })
    .expect("failed to install signal handler");
}
