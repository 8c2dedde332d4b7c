//! Binary entrypoint for the avlgate CLI.
//!
//! Commands:
//! - `start [--bind <addr>]` - run the gateway
//! - `init-config` - write a defaulted config file
//! - `check-imei <IMEI>` - validate an IMEI the way the handshake would

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use avlgate::config::Config;
use avlgate::gateway::{GatewayServer, LogSink};
use avlgate::imei;

#[derive(Parser)]
#[command(name = "avlgate")]
#[command(about = "A TCP gateway for Teltonika FMB-family GPS trackers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "avlgate.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Listen address for the device port, e.g. 0.0.0.0:8833
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Write a default configuration file at the --config path
    InitConfig,
    /// Check an IMEI against the syntactic and Luhn rules (and the
    /// allow-list, when the config enables one)
    CheckImei { imei: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config loads best-effort first so logging can honor it; init-config is
    // expected to run before a file exists.
    let pre_config = Config::load(&cli.config).await.ok();
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start { bind } => {
            let mut config = match pre_config {
                Some(c) => c,
                None => {
                    info!(
                        "no config at {}; starting with built-in defaults",
                        cli.config
                    );
                    Config::default()
                }
            };
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            info!("starting avlgate v{}", env!("CARGO_PKG_VERSION"));

            let mut server = GatewayServer::new(config, Arc::new(LogSink));
            let addr = server.bind().await?;
            info!("device port bound at {addr}");
            server.run().await?;
        }
        Commands::InitConfig => {
            Config::create_default(&cli.config).await?;
            println!("wrote default configuration to {}", cli.config);
        }
        Commands::CheckImei { imei: candidate } => {
            let cfg = pre_config.unwrap_or_default();
            match imei::validate(
                &candidate,
                cfg.admission.imei_allow_enabled,
                &cfg.admission.imei_allow_list,
            ) {
                Ok(()) => println!("{candidate}: valid"),
                Err(e) => {
                    println!("{candidate}: rejected ({e})");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the config level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.as_deref())
            .and_then(|lvl| lvl.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config.as_ref().and_then(|c| c.logging.file.clone());
    let security_path = config.as_ref().and_then(|c| c.logging.security_file.clone());
    if let Some(ref path) = file {
        if let Ok(f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Foreground runs echo to the console as well; under a service
            // manager stdout is usually not a TTY and the file is enough.
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());

                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }

                if record.target() == "security" {
                    if let Some(ref sec_path) = security_path {
                        if let Ok(mut sf) = std::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(sec_path)
                        {
                            let _ = writeln!(sf, "{}", line);
                        }
                    }
                }

                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
