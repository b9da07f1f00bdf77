use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use usbnet_keeper::config::{self, KeeperConfig};
use usbnet_keeper::gadget::{GadgetControl, GadgetLifecycle};
use usbnet_keeper::link::SysfsObserver;
use usbnet_keeper::monitor::Keeper;
use usbnet_keeper::net::{ConnectivityProber, NetProbe, SystemNetProbe};
use usbnet_keeper::persist::{read_records, StatusStore};
use usbnet_keeper::policy::TRACE_TARGET;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the link (default)
    Run,
    /// Print the persisted link status
    Status {
        /// Only this interface
        interface: Option<String>,
    },
    /// Reset the USB gadget once and exit
    Reset,
}

/// usbnet-keeper command line arguments
#[derive(Parser, Debug)]
#[command(name = "usbnet-keeper")]
#[command(version, about = "Keeps a USB-tethered Ethernet gadget alive across host sleep and cable events", long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file (default: /etc/usbnet-keeper/config.toml, optional)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Interface to monitor; repeatable (overrides config)
    #[arg(
        short = 'i',
        long = "interface",
        value_name = "IFACE",
        env = "USBNET_KEEPER_INTERFACES",
        value_delimiter = ','
    )]
    interfaces: Vec<String>,

    /// Persisted link status file (overrides config)
    #[arg(long, value_name = "FILE")]
    state_file: Option<PathBuf>,

    /// USB Device Controller name (overrides config)
    #[arg(long, value_name = "UDC")]
    udc: Option<String>,

    /// Emit reset decision traces
    #[arg(long)]
    debug: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let filter_handle = init_logging(
        log_filter(args.log_level, args.verbose, args.debug),
        args.log_json,
    );

    let mut config = config::load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    // `debug = true` in the config file turns the decision traces on late
    if config.debug && !args.debug {
        if let Some(handle) = filter_handle {
            if let Err(e) = handle.reload(log_filter(args.log_level, args.verbose, true)) {
                tracing::warn!("Failed to enable decision traces: {}", e);
            }
        }
    }

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Status { interface } => status(&config, interface.as_deref()),
        Command::Reset => reset(&config).await,
    }
}

fn apply_overrides(config: &mut KeeperConfig, args: &CliArgs) {
    if !args.interfaces.is_empty() {
        config.monitor.interfaces = args
            .interfaces
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(ref path) = args.state_file {
        config.store.state_file = path.clone();
    }
    if let Some(ref udc) = args.udc {
        config.observer.udc = Some(udc.clone());
    }
    if args.debug {
        config.debug = true;
    }
}

async fn run(config: KeeperConfig) -> anyhow::Result<()> {
    tracing::info!("Starting usbnet-keeper v{}", env!("CARGO_PKG_VERSION"));

    let net: Arc<dyn NetProbe> = Arc::new(SystemNetProbe::new(&config.probe));
    let observer = SysfsObserver::new(config.observer.clone());
    match observer.udc_name() {
        Some(udc) => tracing::info!("USB Device Controller: {}", udc),
        None => tracing::warn!("No USB Device Controller found yet"),
    }

    let prober = ConnectivityProber::new(net.clone(), config.probe.clone());
    let gadget = GadgetLifecycle::from_config(&config, net);
    let store = StatusStore::open(&config.store.state_file);
    let mut keeper = Keeper::new(config, Box::new(observer), prober, Box::new(gadget), store);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        token.cancel();
    });

    keeper.run(shutdown).await;
    Ok(())
}

fn status(config: &KeeperConfig, interface: Option<&str>) -> anyhow::Result<()> {
    let records = read_records(&config.store.state_file)?;

    match interface {
        Some(name) => match records.get(name) {
            Some(record) => println!("{}", record.to_line()),
            None => anyhow::bail!("no record for {}", name),
        },
        None => {
            for record in records.values() {
                println!("{}", record.to_line());
            }
        }
    }
    Ok(())
}

async fn reset(config: &KeeperConfig) -> anyhow::Result<()> {
    let net: Arc<dyn NetProbe> = Arc::new(SystemNetProbe::new(&config.probe));
    let mut gadget = GadgetLifecycle::from_config(config, net);
    gadget.reset().await?;
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

/// Build the log filter from CLI arguments
///
/// `RUST_LOG` takes priority over everything else.
fn log_filter(level: LogLevel, verbose_count: u8, debug: bool) -> EnvFilter {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let mut filter = match effective_level {
        LogLevel::Error => "usbnet_keeper=error",
        LogLevel::Warn => "usbnet_keeper=warn",
        LogLevel::Info => "usbnet_keeper=info",
        LogLevel::Verbose => "usbnet_keeper=debug,usbnet_keeper::net=info",
        LogLevel::Debug => "usbnet_keeper=debug",
        LogLevel::Trace => "usbnet_keeper=trace",
    }
    .to_string();

    // Decision traces are their own channel
    filter.push_str(&format!(
        ",{}={}",
        TRACE_TARGET,
        if debug { "debug" } else { "off" }
    ));

    EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into())
}

/// Initialize logging with tracing
///
/// Returns a handle for swapping the filter once the config file is read.
fn init_logging(filter: EnvFilter, json: bool) -> Option<reload::Handle<EnvFilter, Registry>> {
    let (filter, handle) = reload::Layer::new(filter);

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    match result {
        Ok(()) => Some(handle),
        Err(err) => {
            eprintln!("failed to initialize tracing: {}", err);
            None
        }
    }
}
