use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::runtime;
use tracing::{error, info};

use tlvwire::{
    setup_local_tracing, setup_tracing, AppResult, CancelScope, Connection, FanOut, Message,
    Server, TcpDialer, Text, WireConfig,
};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// run the TLV echo server with a liveness probe per connection
    Serve {
        /// directory for rolling log files
        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,
    },
    /// race connections to every address and report the first that answers
    Dial {
        #[arg(required = true)]
        addresses: Vec<String>,
    },
    /// send one text message and print the echoed reply
    Send { address: String, text: String },
    PrintConfig,
}

fn load_config(conf: Option<&String>) -> AppResult<WireConfig> {
    match conf {
        Some(path) => WireConfig::set_up_config(path),
        None => {
            let default_path = Path::new("./conf.toml");
            if default_path.exists() {
                WireConfig::set_up_config(default_path)
            } else {
                Ok(WireConfig::default())
            }
        }
    }
}

fn main() -> AppResult<()> {
    let commandline = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config = Arc::new(load_config(commandline.conf.as_ref())?);

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    match commandline.command {
        Command::Serve { log_dir } => {
            let _log_guard = setup_tracing(log_dir);
            rt.block_on(serve(config))
        }
        Command::Dial { addresses } => {
            setup_local_tracing()?;
            rt.block_on(dial(config, addresses))
        }
        Command::Send { address, text } => {
            setup_local_tracing()?;
            rt.block_on(send(config, address, text))
        }
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

/// A root scope that ends on ctrl-c.
fn interruptible_scope() -> CancelScope {
    let scope = CancelScope::new();
    let on_signal = scope.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("ctrl-c received, shutting down");
        on_signal.cancel();
    });
    scope
}

async fn serve(config: Arc<WireConfig>) -> AppResult<()> {
    let scope = interruptible_scope();
    let server = Server::bind(scope, config).await?;
    server.run().await
}

async fn dial(config: Arc<WireConfig>, addresses: Vec<String>) -> AppResult<()> {
    let root = interruptible_scope();
    let scope = root.child_with_timeout(config.dial_deadline());
    let fan_out = FanOut::new(TcpDialer::new(config.connect_timeout())).candidates(addresses);

    let report = fan_out.race_report(&scope).await;
    println!(
        "{} of {} attempts finished, scope ended: {:?}",
        report.finished, report.attempts, report.reason
    );
    let winner = report.into_result()?;
    println!("dialer {} connected to {}", winner.id, winner.address);
    Ok(())
}

async fn send(config: Arc<WireConfig>, address: String, text: String) -> AppResult<()> {
    let mut conn = Connection::connect(&address)
        .await?
        .with_max_payload_size(config.codec.max_payload_size);
    conn.set_timeout(config.idle_timeout().unwrap_or(Duration::from_secs(5)));
    conn.write_message(&Message::Text(Text::new(text))).await?;

    match conn.read_message().await? {
        Some(reply) => println!("{}", reply),
        None => println!("server closed the connection"),
    }
    conn.shutdown().await
}
