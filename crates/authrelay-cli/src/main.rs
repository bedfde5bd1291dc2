//! authrelay - command line client for a token-authenticated API.
//!
//! Logs in, keeps the refresh credential in the OS keychain (or a file),
//! and issues authenticated requests that transparently survive an expired
//! access credential.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use authrelay_core::{
    Config, RefreshError, Registration, SessionEnded, SessionManager, StorageBackend,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "authrelay", version, about = "Authenticated API client with automatic credential refresh")]
struct Cli {
    /// API base URL (overrides config and AUTHRELAY_API_BASE)
    #[arg(long, global = true)]
    api_base: Option<String>,

    /// Where to keep the refresh credential
    #[arg(long, global = true, value_parser = parse_storage)]
    storage: Option<StorageBackend>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
    },
    /// Log in with email and password
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Log out and forget stored credentials
    Logout,
    /// Show whether a session is stored and who it belongs to
    Status,
    /// Issue an authenticated GET and print the JSON response
    Get {
        /// Path relative to the API base, e.g. /api/usuario/perfil/
        path: String,
    },
}

fn parse_storage(value: &str) -> Result<StorageBackend, String> {
    value.parse().map_err(|e: anyhow::Error| e.to_string())
}

/// Initialize the tracing subscriber for logging.
/// The returned guard must stay alive for file logs to be flushed.
fn init_tracing(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Log file path has no file name"))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_ref())?;

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(ref api_base) = cli.api_base {
        config.api_base = Some(api_base.clone());
    }
    if let Some(storage) = cli.storage {
        config.storage = storage;
    }
    info!(api_base = %config.api_base(), storage = %config.storage, "authrelay starting");

    let session = SessionManager::from_config(&config)?;
    session.coordinator().subscribe(Arc::new(|_: SessionEnded| {
        eprintln!("Session expired - run `authrelay login` to sign in again.");
    }));

    match cli.command {
        Command::Register {
            email,
            first_name,
            last_name,
        } => register(&session, email, first_name, last_name).await,
        Command::Login { email } => login(&session, &mut config, email).await,
        Command::Logout => {
            session.logout().await?;
            println!("Logged out.");
            Ok(())
        }
        Command::Status => status(&session, &config).await,
        Command::Get { path } => get(&session, &path).await,
    }
}

async fn register(
    session: &SessionManager,
    email: String,
    first_name: String,
    last_name: String,
) -> Result<()> {
    let password = rpassword::prompt_password(format!("New password for {}: ", email))
        .context("Failed to read password")?;
    let confirm = rpassword::prompt_password("Repeat password: ").context("Failed to read password")?;
    if password != confirm {
        anyhow::bail!("Passwords do not match");
    }

    let registration = Registration {
        first_name,
        last_name,
        email,
        password,
    };
    session
        .register(&registration)
        .await
        .context("Registration failed")?;
    println!("Registered {}. Run `authrelay login` to sign in.", registration.email);
    Ok(())
}

async fn login(session: &SessionManager, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => {
            eprint!("Email: ");
            let mut line = String::new();
            io::stdin()
                .read_line(&mut line)
                .context("Failed to read email")?;
            line.trim().to_string()
        }
    };
    if email.is_empty() {
        anyhow::bail!("Email required");
    }

    let password = rpassword::prompt_password(format!("Password for {}: ", email))
        .context("Failed to read password")?;

    let profile = session.login(&email, &password).await?;
    println!("Logged in as {} <{}>", profile.full_name(), profile.email);

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }
    Ok(())
}

async fn status(session: &SessionManager, config: &Config) -> Result<()> {
    println!("API base:  {}", config.api_base());
    println!("Storage:   {}", config.storage);

    if !session.has_stored_session()? {
        println!("Session:   none stored");
        return Ok(());
    }

    if let Err(e) = session.restore().await {
        println!("Session:   {}", ended_message(&e));
        return Ok(());
    }

    match session.profile().await {
        Ok(profile) => println!("Session:   active as {} <{}>", profile.full_name(), profile.email),
        Err(e) => {
            tracing::debug!(error = %e, "Profile lookup failed");
            println!("Session:   active (profile unavailable: {})", e);
        }
    }
    Ok(())
}

/// A failed restore has already cleared the stored credentials
fn ended_message(err: &RefreshError) -> String {
    if err.is_transient() {
        format!("ended, server was unreachable during refresh ({}); log in again", err)
    } else {
        format!("ended ({}); log in again", err)
    }
}

async fn get(session: &SessionManager, path: &str) -> Result<()> {
    if let Err(e) = session.restore().await {
        // Continue anonymously; the endpoint may not need a session
        tracing::debug!(error = %e, "No session restored");
    }

    let body: serde_json::Value = session
        .api()
        .get_json(path)
        .await
        .with_context(|| format!("GET {} failed", path))?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
