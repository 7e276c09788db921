//! `ssmail` - operator command line for the ssmail mail core.
//!
//! Every command prints the facade's JSON envelope on stdout; logs go to
//! stderr and are filtered with `RUST_LOG`.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssmail_core::store::ListQuery;
use ssmail_core::transport::credentials::{
    IMAP_CREDENTIAL, SMTP_CREDENTIAL, delete_secret, store_secret,
};
use ssmail_core::{Compose, CoreConfig, Folder, MailListOptions, MailService, SystemClock};

#[derive(Parser)]
#[command(name = "ssmail", version, about = "Inspect and drive the ssmail mail core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "SSMAIL_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the active backend and provider health
    Status,
    /// Probe every SMTP provider and report health
    Verify,
    /// List a folder of a user's mailbox
    List {
        /// Mailbox owner
        user: String,
        #[arg(short, long, default_value = "inbox")]
        folder: Folder,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        skip: usize,
    },
    /// Search a user's mailbox outside the trash
    Search {
        user: String,
        term: String,
    },
    /// Show mailbox statistics
    Stats {
        user: String,
        /// Days covered by the daily series
        #[arg(short, long, default_value_t = 30)]
        days: u32,
    },
    /// Send a plain text message as a user
    Send {
        /// Sender address
        #[arg(long)]
        from: String,
        /// Recipient address (repeatable)
        #[arg(long = "to", required = true)]
        to: Vec<String>,
        /// Carbon-copy address (repeatable)
        #[arg(long)]
        cc: Vec<String>,
        #[arg(short, long, default_value = "")]
        subject: String,
        #[arg(short, long, default_value = "")]
        body: String,
    },
    /// Pull recent mail from the user's linked accounts into the inbox
    Fetch {
        user: String,
    },
    /// Store the welcome messages for a new user
    Seed {
        user: String,
    },
    /// Manage provider secrets in the platform keyring
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },
}

#[derive(Subcommand)]
enum SecretAction {
    /// Store a secret, read from stdin when no value is given
    Set {
        #[command(flatten)]
        target: SecretTarget,
        #[arg(long, env = "SSMAIL_SECRET_VALUE", hide_env_values = true)]
        value: Option<String>,
    },
    /// Remove a stored secret
    Delete {
        #[command(flatten)]
        target: SecretTarget,
    },
}

#[derive(Args)]
struct SecretTarget {
    /// Login the secret belongs to
    #[arg(value_enum)]
    kind: SecretKind,
    /// SMTP provider name, or the provider of a linked account
    provider: String,
    /// SMTP username, or the linked account address
    address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SecretKind {
    Smtp,
    Imap,
}

impl SecretKind {
    const fn credential(self) -> &'static str {
        match self {
            Self::Smtp => SMTP_CREDENTIAL,
            Self::Imap => IMAP_CREDENTIAL,
        }
    }
}

#[derive(Serialize)]
struct SecretReport<'a> {
    success: bool,
    kind: &'static str,
    provider: &'a str,
    address: &'a str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ssmail=info,ssmail_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    // Keyring commands need neither configuration nor a backend.
    if let Commands::Secret { action } = &cli.command {
        return manage_secret(action);
    }

    let config = CoreConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let service = MailService::initialize(&config, Arc::new(SystemClock)).await;
    info!("Backend ready in {} mode", service.mode());

    match cli.command {
        Commands::Status => print(&service.status()),
        Commands::Verify => print(&service.transports().verify_all().await),
        Commands::List {
            user,
            folder,
            limit,
            skip,
        } => {
            let options = MailListOptions {
                limit,
                skip,
                ..MailListOptions::folder(folder)
            };
            print(&service.get_mails_by_user(&user, &options).await)
        }
        Commands::Search { user, term } => {
            print(&service.search_mails(&user, &term, &ListQuery::default()).await)
        }
        Commands::Stats { user, days } => print(&service.get_mail_statistics(&user, days).await),
        Commands::Send {
            from,
            to,
            cc,
            subject,
            body,
        } => {
            let mut compose = Compose {
                to,
                subject,
                body,
                ..Compose::default()
            };
            compose.options.cc = cc;
            print(&service.send_mail(&from, compose).await)
        }
        Commands::Fetch { user } => print(&service.import_external(&user).await),
        Commands::Seed { user } => print(&service.seed_sample_mail(&user).await),
        Commands::Secret { .. } => Ok(()),
    }
}

fn manage_secret(action: &SecretAction) -> anyhow::Result<()> {
    let target = match action {
        SecretAction::Set { target, value } => {
            let secret = match value {
                Some(value) => value.clone(),
                None => read_secret()?,
            };
            anyhow::ensure!(!secret.is_empty(), "refusing to store an empty secret");
            store_secret(target.kind.credential(), &target.provider, &target.address, &secret)
                .context("storing secret in keyring")?;
            target
        }
        SecretAction::Delete { target } => {
            delete_secret(target.kind.credential(), &target.provider, &target.address)
                .context("deleting secret from keyring")?;
            target
        }
    };
    info!(
        "Updated {} secret for {}/{}",
        target.kind.credential(),
        target.provider,
        target.address
    );
    print(&SecretReport {
        success: true,
        kind: target.kind.credential(),
        provider: &target.provider,
        address: &target.address,
    })
}

fn read_secret() -> anyhow::Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("reading secret from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}
