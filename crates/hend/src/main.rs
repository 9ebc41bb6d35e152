use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hen_core::credentials::{CredentialStore, FileCredentialStore, StaticCredentials};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

mod auth;
mod broadcast;
mod connection;
mod directory;
mod session;

use session::{run_session, Hub, SessionSettings};

#[derive(Parser, Debug)]
#[command(
    name = "hend",
    version,
    about = "Line-oriented telnet chat server",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(default_value_t = 6000)]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// TOML file of `nick = "password"` pairs; built-in demo accounts if absent.
    #[arg(long)]
    credentials: Option<PathBuf>,

    #[arg(long)]
    redis: Option<String>,

    #[arg(long, default_value_t = 64)]
    queue: usize,

    /// Milliseconds one outbound send may wait on a full client queue.
    #[arg(long, default_value_t = 5000)]
    send_timeout: u64,

    #[arg(long)]
    idle_timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Users {
        #[arg(long)]
        credentials: PathBuf,

        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    Add { nick: String, password: String },
    Remove { nick: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Some(command) = &cli.command {
        return handle_admin(command).await;
    }

    let credentials = credential_store(&cli)?;
    let settings = SessionSettings {
        queue_depth: cli.queue,
        send_timeout: Duration::from_millis(cli.send_timeout),
        idle_timeout: cli.idle_timeout.map(Duration::from_secs),
    };
    let hub = Arc::new(Hub::new(credentials, settings));

    let bind = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, "hend listening");

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let hub = hub.clone();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            run_session(hub, reader, writer, addr).await;
        });
    }
}

fn credential_store(cli: &Cli) -> Result<Arc<dyn CredentialStore>> {
    if let Some(url) = cli.redis.clone() {
        #[cfg(feature = "redis")]
        {
            let client = redis::Client::open(url)?;
            let store = hen_core::credentials::redis_store::RedisCredentialStore::new(
                client,
                "hen:credentials",
            );
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "redis"))]
        {
            let _ = url;
            warn!("redis feature not enabled, ignoring --redis");
        }
    }
    match &cli.credentials {
        Some(path) => {
            info!(path = %path.display(), "using credentials file");
            Ok(Arc::new(FileCredentialStore::new(path.clone())))
        }
        None => {
            warn!("no --credentials given, using built-in demo accounts");
            Ok(Arc::new(StaticCredentials::demo()))
        }
    }
}

async fn handle_admin(command: &Commands) -> Result<()> {
    match command {
        Commands::Users {
            credentials,
            command,
        } => {
            let store = FileCredentialStore::new(credentials.clone());
            match command {
                UserCommands::Add { nick, password } => {
                    store.add(nick, password).await?;
                    println!("added {nick}");
                }
                UserCommands::Remove { nick } => {
                    if store.remove(nick).await? {
                        println!("removed {nick}");
                    } else {
                        println!("no such user {nick}");
                    }
                }
                UserCommands::List => {
                    for nick in store.list().await? {
                        println!("{nick}");
                    }
                }
            }
        }
    }
    Ok(())
}
