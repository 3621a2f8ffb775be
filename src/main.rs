mod compensation;
mod config;
mod display;
mod models;
mod monitor;
mod scheduler;
mod sensors;
mod upload;
mod utils;

use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::fs::OpenOptions;
use std::path::PathBuf;
use tokio::sync::watch;

use config::{max_uploads_from, AppConfig};
use display::{DisplaySink, LedMatrix, TerminalDashboard};
use monitor::{Monitor, MonitorSettings};
use scheduler::ScheduleSettings;
use upload::{AdafruitClient, DryRunClient, UploadClient, Uploader};
use utils::format_datetime;

/// Sense HAT environment monitor uploading to Adafruit IO
#[derive(Debug, Parser)]
#[command(name = "sensemon", version, about)]
struct Cli {
    /// Do not draw the terminal dashboard
    #[arg(long)]
    no_cli: bool,

    /// Do not use the LED matrix
    #[arg(long)]
    no_led: bool,

    /// Show upload progress bar on the LED matrix
    #[arg(long)]
    progress: bool,

    /// Number of uploads before exiting (0 or less means unlimited)
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    uploads: Option<i64>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Upload once and exit, for use from cron
    #[arg(long)]
    cron: bool,

    /// Append log output to a file
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Load settings from an env-style file instead of .env
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log readings instead of uploading them
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(level: LevelFilter, log_file: Option<&PathBuf>) -> std::io::Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level).format_timestamp_secs();

    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

/// Build the uploader, verifying the feeds exist unless this is a dry run
async fn build_uploader(
    config: &AppConfig,
    dry_run: bool,
) -> Result<Uploader, Box<dyn std::error::Error>> {
    if dry_run {
        let feeds = config
            .upload_settings()
            .map(|settings| settings.feeds)
            .unwrap_or_default();
        info!("Dry run: readings will not be uploaded");
        return Ok(Uploader::new(Box::new(DryRunClient), feeds, config.rounding));
    }

    let settings = config.upload_settings()?;
    let client = AdafruitClient::new(settings.base_url, &settings.username, &settings.key);

    for feed in [
        &settings.feeds.temperature,
        &settings.feeds.pressure,
        &settings.feeds.humidity,
    ] {
        let info = client.verify_feed(feed).await?;
        info!("Verified feed '{}' ({})", info.key, info.name);
    }

    let client: Box<dyn UploadClient> = Box::new(client);
    Ok(Uploader::new(client, settings.feeds, config.rounding))
}

fn build_sinks(cli: &Cli, config: &AppConfig) -> Vec<Box<dyn DisplaySink + Send>> {
    let mut sinks: Vec<Box<dyn DisplaySink + Send>> = Vec::new();

    if !cli.no_cli && !cli.cron {
        sinks.push(Box::new(TerminalDashboard::stdout()));
    }

    if !cli.no_led {
        let progress = cli.progress || config.progress;
        match LedMatrix::open(&config.led_device, config.display_mode, progress) {
            Ok(led) => {
                let led = led.with_sleep(config.led_sleep);
                info!(
                    "LED matrix on {} showing {}",
                    config.led_device.display(),
                    config.display_mode
                );
                sinks.push(Box::new(led));
            }
            Err(e) => warn!(
                "LED matrix unavailable at {}: {}",
                config.led_device.display(),
                e
            ),
        }
    }

    sinks
}

fn schedule_settings(cli: &Cli, config: &AppConfig) -> ScheduleSettings {
    let mut schedule = ScheduleSettings {
        base_frequency: config.freq,
        first_delay: config.delay,
        throttle_penalty: config.throttle,
        max_uploads: cli.uploads.map_or(config.max_uploads, max_uploads_from),
    };

    if cli.cron {
        schedule.first_delay = 0.0;
        schedule.max_uploads = Some(1);
    }
    schedule
}

/// Flip the stop flag on Ctrl+C or SIGTERM
fn spawn_signal_listener(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        result = tokio::signal::ctrl_c() => {
                            if let Err(e) = result {
                                error!("Failed to listen for Ctrl+C: {}", e);
                                return;
                            }
                        }
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("Failed to listen for SIGTERM: {}", e);
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }

        info!("Shutdown requested, finishing current tick");
        let _ = tx.send(true);
    });
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Must happen before any runtime threads exist
    utils::init_local_offset();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_logging(LevelFilter::Info, None)?;
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Initialize logging
    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        config.log_level.unwrap_or(LevelFilter::Info)
    };
    init_logging(level, cli.log.as_ref())?;

    let uploader = match build_uploader(&config, cli.dry_run).await {
        Ok(uploader) => uploader,
        Err(e) => {
            error!("Application terminated due to REQUEST ERROR: {}", e);
            return Err(e);
        }
    };

    let sensors = match sensors::open(config.sensors) {
        Ok(sensors) => sensors,
        Err(e) => {
            error!("Failed to open {} sensors: {}", config.sensors, e);
            return Err(e.into());
        }
    };

    let settings = MonitorSettings {
        wait: config.wait,
        comp_factor: config.temp_comp,
        cpu_window: config.cpu_temps,
        schedule: schedule_settings(&cli, &config),
    };
    let mut monitor = Monitor::new(sensors, uploader, build_sinks(&cli, &config), settings);

    let (tx, rx) = watch::channel(false);
    spawn_signal_listener(tx);

    match monitor.run(rx).await {
        Ok(summary) => {
            info!("Work start:  {}", format_datetime(&summary.started));
            info!("Work end:    {}", format_datetime(&summary.finished));
            info!("Num uploads: {}", summary.uploads);
            Ok(())
        }
        Err(e) => {
            let summary = monitor.summary();
            error!("Fatal error: {}", e);
            info!("Num uploads: {}", summary.uploads);
            Err(e.into())
        }
    }
}
