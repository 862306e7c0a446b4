use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tessera::{
    Client, ClientConfig, ClientHandshake, GroupConfig, Inbound, ProtocolError, Rendezvous, RendezvousServer,
    ServerConfig, ServerKeys, ServerPublicKey, VerifierTable, DEFAULT_RSA_BITS,
};

#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Group parameters (prime, generator, salt). Defaults to the 1536-bit MODP group.
    #[arg(short, long, global = true)]
    group: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the server's long-term RSA keypair.
    Keygen {
        #[arg(long, default_value = "server.pem")]
        private: PathBuf,
        #[arg(long, default_value = "server.pub.pem")]
        public: PathBuf,
        #[arg(long, default_value_t = DEFAULT_RSA_BITS)]
        bits: usize,
    },
    /// Add or replace a user's password verifier.
    Enroll {
        #[arg(short, long, default_value = "verifiers.json")]
        verifiers: PathBuf,
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        password: String,
    },
    /// Run the rendezvous server.
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:9090")]
        bind: SocketAddr,
        #[arg(short, long, default_value = "server.pem")]
        key: PathBuf,
        #[arg(short, long, default_value = "verifiers.json")]
        verifiers: PathBuf,
    },
    /// Log in and print who is online.
    List(Login),
    /// Log in and ask the server to introduce us to a peer.
    Talk {
        #[command(flatten)]
        login: Login,
        #[arg(long)]
        peer: String,
    },
    /// Log in and print pushes and introductions until disconnected.
    Listen(Login),
}

#[derive(Args, Debug)]
struct Login {
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    server: SocketAddr,
    #[arg(long, default_value = "server.pub.pem")]
    server_key: PathBuf,
    #[arg(short, long)]
    user: String,
    #[arg(short, long)]
    password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let group_config = match &cli.group {
        Some(path) => GroupConfig::load(path)?,
        None => GroupConfig::default(),
    };

    match cli.command {
        Command::Keygen { private, public, bits } => {
            let keys = ServerKeys::generate(bits)?;
            std::fs::write(&private, keys.to_pem()?)
                .with_context(|| format!("failed to write {}", private.display()))?;
            std::fs::write(&public, keys.public().to_pem()?)
                .with_context(|| format!("failed to write {}", public.display()))?;
            info!(private = %private.display(), public = %public.display(), bits, "keypair written");
        }
        Command::Enroll { verifiers, user, password } => {
            let group = group_config.group()?;
            let mut table = if verifiers.exists() {
                VerifierTable::load(&verifiers)?
            } else {
                VerifierTable::new()
            };
            table.enroll(&group, group_config.salt(), &user, &password);
            table.save(&verifiers)?;
            info!(user = %user, users = table.len(), "verifier stored");
        }
        Command::Serve { bind, key, verifiers } => {
            let keys = ServerKeys::load(&key)?;
            let table = VerifierTable::load(&verifiers)?;
            let config = ServerConfig::default();
            info!(users = table.len(), "verifier table loaded");

            let engine = Rendezvous::new(&config, group_config.group()?, keys, table);
            let server = RendezvousServer::bind(&bind.to_string(), engine, &config).await?;

            // Graceful shutdown on Ctrl+C
            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            info!(sessions = server.sessions().await.len(), "Received shutdown signal, exiting gracefully");
            server.quit().await;
        }
        Command::List(login) => {
            let mut client = connect(&group_config, &login).await?;
            let users = client.list_users().await.context("list request went unanswered")?;
            for user in users {
                println!("{}", user);
            }
            client.disconnect().await.context("logout went unanswered")?;
        }
        Command::Talk { login, peer } => {
            let mut client = connect(&group_config, &login).await?;
            let grant = client
                .talk_to(&peer)
                .await
                .with_context(|| format!("introduction to {} was refused", peer))?;
            println!("{} is at {}", peer, grant.address);
            println!("ticket key {}", hex::encode(grant.key.as_bytes()));
        }
        Command::Listen(login) => {
            let mut client = connect(&group_config, &login).await?;
            loop {
                match client.next_inbound().await {
                    Ok(Inbound::Disconnected) => {
                        println!("disconnected by server");
                        break;
                    }
                    Ok(Inbound::Introduction(intro)) => {
                        println!("{} at {} wants to talk", intro.peer, intro.address);
                        println!("ticket key {}", hex::encode(intro.key.as_bytes()));
                    }
                    Err(ProtocolError::Timeout) => continue,
                    Err(e) => {
                        warn!(error = %e, "receive failed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn connect(group_config: &GroupConfig, login: &Login) -> Result<Client> {
    let server_key = ServerPublicKey::load(&login.server_key)?;
    let handshake = ClientHandshake::new(
        group_config.group()?,
        server_key,
        &login.user,
        &login.password,
        group_config.salt(),
    );

    let bind = if login.server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await.context("failed to bind client socket")?;
    let config = ClientConfig {
        recv_timeout: Duration::from_secs(10),
        ..ClientConfig::default()
    };

    Client::connect(socket, login.server, handshake, config)
        .await
        .context("login failed")
}
