use std::{
    num::NonZeroUsize,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use stampede::{
    config::{self, Config, Telemetry},
    datagen,
    driver::{self, Driver},
};
use stampede_payload::dataset;
use tokio::{
    runtime::Builder,
    signal,
    time::{self, Duration, sleep},
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Stampede driver returned an error: {0}")]
    Driver(#[from] driver::Error),
    #[error("Data generation failed: {0}")]
    Datagen(#[from] datagen::Error),
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/stampede/stampede.yaml")
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured workload
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigArgs),
    /// Write a synthetic phase to dataset files without pacing
    Datagen(DatagenCommand),
}

#[derive(Args)]
struct ConfigArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value_os_t = default_config_path())]
    config_path: PathBuf,
}

#[derive(Args)]
struct RunCommand {
    #[command(flatten)]
    config: ConfigArgs,
    /// stop the run after this many seconds, run to completion if absent
    #[clap(long)]
    experiment_duration_seconds: Option<u64>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct DatagenCommand {
    #[command(flatten)]
    config: ConfigArgs,
    /// output path template, `%NNN%` is replaced by the partition number
    #[clap(long)]
    output_template: String,
    /// number of output files
    #[clap(long, default_value = "1")]
    partitions: NonZeroUsize,
    /// number of generating threads
    #[clap(long, default_value = "1")]
    threads: NonZeroUsize,
    /// index of the phase to generate, the first synthetic phase if absent
    #[clap(long)]
    phase: Option<usize>,
}

fn install_telemetry(telemetry: Option<Telemetry>) {
    let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = telemetry
    else {
        return;
    };
    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    for (k, v) in global_labels {
        builder = builder.add_global_label(k, v);
    }
    tokio::spawn(async move {
        match builder.install() {
            Ok(()) => info!(%addr, "prometheus exporter listening"),
            Err(err) => error!("Failed to install prometheus recorder: {err}"),
        }
    });
}

async fn inner_main(experiment_duration: Duration, config: Config) -> Result<u64, Error> {
    install_telemetry(config.telemetry.clone());

    let driver = Driver::new();
    driver.load(config)?;
    driver.start()?;

    let join = driver.join();
    tokio::pin!(join);
    let timer = sleep(experiment_duration);
    tokio::pin!(timer);
    let mut interval = time::interval(Duration::from_millis(400));
    let mut stopping = false;
    let res = loop {
        tokio::select! {
            _ = interval.tick() => {
                let progress = driver.progress();
                gauge!("stampede.running").set(1.0);
                gauge!("stampede.phase").set(progress.phase as f64);
                gauge!("stampede.events_sent").set(progress.total_events_sent as f64);
            },
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                stopping = true;
                driver.stop()?;
            },
            () = &mut timer, if !stopping => {
                info!("experiment duration exceeded, signaling for shutdown");
                stopping = true;
                driver.stop()?;
            },
            res = &mut join => break res,
        }
    };
    gauge!("stampede.running").set(0.0);
    Ok(res?)
}

fn run(cmd: &RunCommand) -> Result<(), Error> {
    let config = Config::load(&cmd.config.config_path).inspect_err(|err| {
        error!("Configuration validation failed: {err}");
    })?;
    let experiment_duration = cmd
        .experiment_duration_seconds
        .map_or(Duration::MAX, Duration::from_secs);
    let max_shutdown_delay = Duration::from_secs(cmd.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(experiment_duration, config));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    let sent = res?;
    info!(sent, "Bye. :)");
    Ok(())
}

fn generate(cmd: &DatagenCommand) -> Result<(), Error> {
    let config = Config::load(&cmd.config.config_path)?;
    let options = datagen::Options {
        template: cmd.output_template.clone(),
        partitions: cmd.partitions,
        threads: cmd.threads,
        phase: cmd.phase,
        format: dataset::Format {
            has_types: true,
            has_timestamps: true,
            ..dataset::Format::default()
        },
    };
    let base = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let written = datagen::generate(&config, &options, base)?;
    info!(written, "datagen finished");
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting stampede {version}.");

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(cmd) => run(&cmd),
        Commands::ConfigCheck(args) => match Config::load(&args.config_path) {
            Ok(_) => {
                info!("Configuration file is valid");
                std::process::exit(0)
            }
            Err(err) => {
                error!("Configuration validation failed: {err}");
                std::process::exit(1)
            }
        },
        Commands::Datagen(cmd) => generate(&cmd),
    }
}
