use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use smewtd::config::{default_data_dir, format_config, Config};
use smewtd::daemon::server::read_daemon_pid;
use smewtd::daemon::{DaemonClient, DaemonServer, Smewtd};
use smewtd::logging::{init_logging, level_for, LogConfig};
use smewtd::peer_api::start_peer_server;
use smewtd::transfer::{TransferId, TransferInfo};

#[derive(Parser)]
#[command(name = "smewtd")]
#[command(version)]
#[command(about = "Query and fetch media from your friends' libraries")]
#[command(
    long_about = "A daemon that answers media queries from a local index, forwards them to trusted friends, and downloads files friends share into an incoming folder."
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the daemon's Unix socket
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write JSON logs to this file, rotated daily
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Serve,
    /// Check that the daemon is alive
    Ping,
    /// Query the local index
    Query {
        /// Query text, e.g. `title:matrix year:1999`
        text: String,
    },
    /// List local movies
    Movies,
    /// Query one friend
    DistantQuery {
        /// Friend name
        host: String,
        text: String,
    },
    /// Query the local index and every friend
    Broadcast { text: String },
    /// Download a file from a friend
    Download { friend: String, filename: String },
    /// List transfers
    Transfers,
    /// Forget a finished transfer
    Ack { id: TransferId },
    /// List configured friends
    Friends,
    /// Ask the daemon to shut down
    Quit,
    /// Show the current configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Config::load().context("Failed to load config"),
    }
}

/// Socket to talk to: `--socket`, else the configured one, else the default
fn socket_path(cli: &Cli) -> PathBuf {
    if let Some(ref socket) = cli.socket {
        return socket.clone();
    }
    match load_config(cli.config.as_ref()) {
        Ok(config) => config.socket_path(),
        Err(_) => default_data_dir().join("smewtd.sock"),
    }
}

fn print_records(records: &[String]) {
    if records.is_empty() {
        println!("No results");
    }
    for record in records {
        println!("{}", record);
    }
}

fn print_transfer(info: &TransferInfo) {
    let state = serde_json::to_value(info.state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    print!(
        "{}  {:<12} {}:{}  {} bytes",
        info.id, state, info.friend, info.filename, info.bytes_received
    );
    match info.cause {
        Some(ref cause) => println!("  ({})", cause),
        None => println!(),
    }
}

async fn serve(cli: &Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let facade = Arc::new(Smewtd::from_config(&config).context("Failed to start daemon")?);

    let peer = start_peer_server(
        &config.peer_listen,
        facade.peer_state(config.shared_folder.clone(), config.peer_token.clone()),
        facade.shutdown_signal(),
    )
    .await
    .with_context(|| format!("Failed to bind peer API on {}", config.peer_listen))?;

    let socket = cli.socket.clone().unwrap_or_else(|| config.socket_path());
    let server = DaemonServer::new(
        Arc::clone(&facade),
        socket,
        config.pid_path(),
        config.shutdown_grace(),
    );
    let handle = server.run().await.context("Failed to start IPC server")?;

    handle.wait().await;
    peer.wait().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let serving = matches!(cli.command, Commands::Serve);
    let _guard = init_logging(&LogConfig {
        level: level_for(cli.verbose, serving),
        log_file: cli.log_file.clone(),
    })
    .context("Failed to set up logging")?;

    match cli.command {
        Commands::Serve => return serve(&cli).await,
        Commands::Config => {
            let config = load_config(cli.config.as_ref())?;
            println!("{}", format_config(&config));
            return Ok(());
        }
        _ => {}
    }

    let socket = socket_path(&cli);
    let mut client = DaemonClient::connect_to(socket.clone())
        .await
        .with_context(|| format!("Cannot reach daemon at {}", socket.display()))?;

    match cli.command {
        Commands::Serve | Commands::Config => {}
        Commands::Ping => {
            client.ping().await?;
            let pid = load_config(cli.config.as_ref())
                .ok()
                .and_then(|config| read_daemon_pid(&config.pid_path()));
            match pid {
                Some(pid) => println!("pong (pid {})", pid),
                None => println!("pong"),
            }
        }
        Commands::Query { ref text } => print_records(&client.query(text).await?),
        Commands::Movies => print_records(&client.query_movies().await?),
        Commands::DistantQuery { ref host, ref text } => {
            print_records(&client.distant_query(host, text).await?)
        }
        Commands::Broadcast { ref text } => {
            let outcome = client.broadcast(text).await?;
            print_records(&outcome.records);
            for failure in &outcome.failed {
                eprintln!("{} failed ({}): {}", failure.source, failure.kind, failure.message);
            }
        }
        Commands::Download {
            ref friend,
            ref filename,
        } => {
            let info = client.start_download(friend, filename).await?;
            println!("Started transfer {} -> {}", info.id, info.destination.display());
        }
        Commands::Transfers => {
            let transfers = client.list_transfers().await?;
            if transfers.is_empty() {
                println!("No transfers");
            }
            for info in &transfers {
                print_transfer(info);
            }
        }
        Commands::Ack { id } => {
            client.acknowledge_transfer(id).await?;
            println!("Acknowledged {}", id);
        }
        Commands::Friends => {
            for friend in client.list_friends().await? {
                let auth = if friend.has_credential { "" } else { " (no credential)" };
                println!("{}  {}{}", friend.name, friend.address, auth);
            }
        }
        Commands::Quit => {
            client.quit().await?;
            println!("Daemon is shutting down");
        }
    }

    Ok(())
}
