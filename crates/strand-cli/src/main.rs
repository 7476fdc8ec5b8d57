//! Strand CLI
//!
//! Runs relay servers and manages the keys and credentials a mesh
//! deployment needs.

mod config;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::Config;
use strand_crypto::credential::{CredentialClaims, CredentialSigner, CredentialVerifier};
use strand_crypto::x25519::PrivateKey;
use strand_relay::{Server, ServerConfig, hooks};

/// Strand - peer-to-peer mesh overlay
#[derive(Parser)]
#[command(name = "strand")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Relay {
        /// Listen address, overrides `[relay] listen_addr`
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Generate a new X25519 static key
    Keygen {
        /// Output file, overrides the configured key file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the relay server key (`[relay] private_key_file`) instead
        /// of the node key (`[node] private_key_file`)
        #[arg(long)]
        relay: bool,

        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Issue and check node credentials
    Credential {
        #[command(subcommand)]
        command: CredentialCommands,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum CredentialCommands {
    /// Generate an RSA signing key pair for test deployments
    Signer {
        /// Directory to write `credential.pem` and `credential_public.pem` into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// RSA modulus size
        #[arg(long, default_value_t = 2048)]
        bits: usize,
    },

    /// Sign a credential for a node
    Issue {
        /// RSA private key (PKCS#1 PEM)
        #[arg(long)]
        signing_key: PathBuf,

        /// Owner of the node
        #[arg(long)]
        user_id: u64,

        /// Peer id of the node
        #[arg(long)]
        peer_id: u64,

        /// Virtual address of the node
        #[arg(long)]
        ip: IpAddr,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 86_400)]
        lease: u64,
    },

    /// Verify a base64 credential
    Verify {
        /// Credential to check
        credential: String,

        /// RSA public key (PEM), defaults to `[relay] credential_public_key_file`
        #[arg(long)]
        public_key: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    // `config init` must work before any file exists
    if let Commands::Config {
        command: ConfigCommands::Init { force },
    } = &cli.command
    {
        init_logging(cli.verbose, "info");
        return init_config(&config_path, *force);
    }

    let config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else if cli.config.is_none() {
        Config::load_or_default()?
    } else {
        anyhow::bail!("Config file not found: {}", config_path.display());
    };

    init_logging(cli.verbose, &config.logging.level);
    config.validate()?;

    match cli.command {
        Commands::Relay { listen } => run_relay(listen, &config).await?,
        Commands::Keygen { output, relay, force } => {
            let path = output.unwrap_or_else(|| config.key_file(relay).to_path_buf());
            generate_keypair(&path, force)?;
        }
        Commands::Credential { command } => match command {
            CredentialCommands::Signer { output, bits } => generate_signer(&output, bits)?,
            CredentialCommands::Issue {
                signing_key,
                user_id,
                peer_id,
                ip,
                lease,
            } => issue_credential(&signing_key, user_id, peer_id, ip, lease)?,
            CredentialCommands::Verify {
                credential,
                public_key,
            } => verify_credential(&credential, public_key, &config)?,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => show_config(&config_path, &config)?,
            ConfigCommands::Init { force } => init_config(&config_path, force)?,
        },
    }

    Ok(())
}

/// `--verbose` wins, then `RUST_LOG`, then the configured level.
fn init_logging(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run a relay server until Ctrl-C
async fn run_relay(listen: Option<String>, config: &Config) -> anyhow::Result<()> {
    let listen: SocketAddr = match listen {
        Some(addr) => addr.parse().with_context(|| format!("Invalid listen address '{addr}'"))?,
        None => config.relay_listen_addr()?,
    };

    let pem = std::fs::read_to_string(&config.relay.credential_public_key_file).with_context(|| {
        format!(
            "Failed to read credential public key {}",
            config.relay.credential_public_key_file.display()
        )
    })?;
    let verifier = CredentialVerifier::from_pem(&pem)?;

    let key = load_private_key(&config.relay.private_key_file)?;

    let server = Server::new(
        ServerConfig {
            heartbeat_interval: config.heartbeat_interval(),
            ..ServerConfig::default()
        },
        verifier,
    );
    hooks::register_forwarding(&server);

    if let Some(mut events) = server.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                tracing::debug!("Relay event: {:?}", event);
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(listen).await?;

    println!("Strand Relay");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", listener.local_addr()?);
    println!("Public key: {}", key.public_key().to_base64());
    println!("Heartbeat: {:?}", config.heartbeat_interval());
    println!("\nPress Ctrl+C to stop");

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    tracing::info!("Closing relay with {} sessions", server.session_count());
    server.close();

    match tokio::time::timeout(Duration::from_secs(5), serving).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => anyhow::bail!("Relay task failed: {e}"),
        Err(_) => tracing::warn!("Relay did not stop within 5s"),
    }

    Ok(())
}

/// Read a raw 32 byte X25519 key file
fn load_private_key(path: &Path) -> anyhow::Result<PrivateKey> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read private key {} (run `strand keygen`)", path.display()))?;
    Ok(PrivateKey::from_slice(&bytes)?)
}

fn write_secret(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Generate a new X25519 static key
fn generate_keypair(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    println!("Generating new X25519 static key...");

    let key = PrivateKey::generate(&mut rand_core::OsRng);
    let public = key.public_key();

    println!("Public key: {}", public.to_base64());
    println!("Public key (hex): {}", hex::encode(public.to_bytes()));

    write_secret(path, &key.to_bytes())?;
    println!("Private key saved to: {}", path.display());
    println!("\nKeep this file secure! It contains your private key.");

    Ok(())
}

fn generate_signer(output: &Path, bits: usize) -> anyhow::Result<()> {
    println!("Generating {bits}-bit RSA credential signer...");

    let signer = CredentialSigner::generate(bits)?;
    let private_path = output.join("credential.pem");
    let public_path = output.join("credential_public.pem");

    write_secret(&private_path, signer.to_pem()?.as_bytes())?;
    std::fs::write(&public_path, signer.verifier().to_pem()?)?;

    println!("Signing key: {}", private_path.display());
    println!("Verification key: {}", public_path.display());
    Ok(())
}

fn issue_credential(
    signing_key: &Path,
    user_id: u64,
    peer_id: u64,
    ip: IpAddr,
    lease: u64,
) -> anyhow::Result<()> {
    let pem = std::fs::read_to_string(signing_key)
        .with_context(|| format!("Failed to read signing key {}", signing_key.display()))?;
    let signer = CredentialSigner::from_pem(&pem)?;

    let claims = CredentialClaims::with_lease(user_id, peer_id, ip, Duration::from_secs(lease));
    let credential = signer.issue(&claims)?;

    tracing::info!(
        user_id,
        peer_id,
        expires_at = claims.expires_at,
        "Issued credential"
    );
    println!("{}", STANDARD.encode(credential));
    Ok(())
}

fn verify_credential(
    credential: &str,
    public_key: Option<PathBuf>,
    config: &Config,
) -> anyhow::Result<()> {
    let path = public_key.unwrap_or_else(|| config.relay.credential_public_key_file.clone());
    let pem = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read public key {}", path.display()))?;
    let verifier = CredentialVerifier::from_pem(&pem)?;

    let blob = STANDARD
        .decode(credential.trim())
        .context("Credential is not valid base64")?;
    let claims = verifier.verify(&blob)?;

    println!("Credential valid");
    println!("  User: {}", claims.user_id);
    println!("  Peer: {}", claims.peer_id);
    println!("  Address: {}", claims.ip);
    println!("  Expires: {} (unix)", claims.expires_at);
    Ok(())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn show_config(path: &Path, config: &Config) -> anyhow::Result<()> {
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
