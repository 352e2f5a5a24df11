mod signals;
mod supervisor;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use supervisor::Supervisor;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use warden_channel::ChannelConfig;
use warden_container::{Container, MemoryContainer};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "warden-daemon")]
#[command(about = "Host side of the compartment control channel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host one compartment and serve its guest agent
    Run {
        /// JSON channel configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Socket path, overriding the configuration
        #[arg(long)]
        socket_path: Option<PathBuf>,

        /// Container name reported to the guest
        #[arg(long, default_value = "warden0")]
        name: String,

        /// DNS server reported to the guest
        #[arg(long, default_value = "10.0.2.3")]
        dns: String,

        /// Container UUID (random if omitted)
        #[arg(long)]
        uuid: Option<Uuid>,

        /// Seconds to wait for the guest to shut down before stopping it
        #[arg(long, default_value_t = 10)]
        stop_timeout: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            socket_path,
            name,
            dns,
            uuid,
            stop_timeout,
        } => {
            let mut config = match config {
                Some(path) => {
                    tracing::info!("Loading channel configuration from {:?}", path);
                    ChannelConfig::from_json_file(&path)?
                }
                None => ChannelConfig::default(),
            };
            if let Some(socket_path) = socket_path {
                config.socket_path = socket_path;
            }
            config.validate()?;

            let container = Rc::new(MemoryContainer::with_uuid(
                &name,
                uuid.unwrap_or_else(Uuid::new_v4),
            ));
            container.set_dns_server(&dns);

            signals::setup()?;

            let mut supervisor =
                Supervisor::new(container, config, Duration::from_secs(stop_timeout));
            supervisor.start()?;

            while !supervisor.is_stopped() {
                if signals::take_shutdown() {
                    supervisor.stop();
                }
                if signals::take_toggle_suspend() {
                    supervisor.toggle_suspend();
                }
                if signals::take_cycle_connectivity() {
                    supervisor.cycle_connectivity();
                }
                supervisor.poll(POLL_INTERVAL)?;
            }

            supervisor.shutdown();
        }
    }

    Ok(())
}
