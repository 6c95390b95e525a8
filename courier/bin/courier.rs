//! Command-line front end for the courier relay engine.
//!
//! - `send`: compose and deliver one message
//! - `status`: relay configuration joined with health
//! - `check`: probe every relay without sending
//! - `validate`: load the configuration and relays, and report problems

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use courier::{
    Courier, CourierConfig, EnvRelaySource, FileRelaySource, SendRequest, config::CONFIG_ENV,
};
use courier_common::logging;
use courier_delivery::{ProbeReport, StatusReport};
use courier_smtp::client::Attachment;

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Send mail through prioritised SMTP relays", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (RON). Defaults to the usual search path.
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compose and deliver one message
    Send {
        /// Sender; defaults to the configured default sender
        #[arg(long)]
        from: Option<String>,

        #[arg(long, required = true)]
        to: Vec<String>,

        #[arg(long)]
        cc: Vec<String>,

        #[arg(long)]
        bcc: Vec<String>,

        #[arg(long)]
        reply_to: Option<String>,

        #[arg(short, long, default_value = "")]
        subject: String,

        /// Plain-text body
        #[arg(short, long, conflicts_with = "body_file")]
        body: Option<String>,

        /// Read the plain-text body from a file
        #[arg(long)]
        body_file: Option<PathBuf>,

        /// Read an HTML body from a file
        #[arg(long)]
        html_file: Option<PathBuf>,

        /// Attach a file (repeatable)
        #[arg(long)]
        attach: Vec<PathBuf>,
    },
    /// Show relays, health and the relay the next send would use
    Status {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Probe every relay: connect, TLS, authenticate, quit
    Check,
    /// Load the configuration and relays without contacting anything
    Validate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Ron,
}

fn load(cli: &Cli) -> anyhow::Result<Courier> {
    let courier = match &cli.config {
        Some(path) => {
            let config = CourierConfig::load(path)?;
            if config.relays.is_some() {
                Courier::new(&config, FileRelaySource::new(path))?
            } else {
                Courier::new(&config, EnvRelaySource::new())?
            }
        }
        None => Courier::from_environment()?,
    };
    Ok(courier)
}

async fn cmd_send(courier: &Courier, mut request: SendRequest, attach: Vec<PathBuf>) -> anyhow::Result<()> {
    for path in attach {
        request.attachments.push(Attachment::from_file(&path).await?);
    }

    match courier.send(&request).await {
        Ok(receipt) => {
            println!("Delivered via {}", receipt.relay);
            println!("  Message-ID: {}", receipt.message_id);
            println!("  Response:   {}", receipt.response);
            for attempt in receipt.attempts.iter().filter(|a| !a.succeeded) {
                println!(
                    "  Failed over from {}: {}",
                    attempt.relay,
                    attempt.error.as_deref().unwrap_or_default()
                );
            }
            Ok(())
        }
        Err(failure) => {
            for attempt in &failure.attempts {
                eprintln!(
                    "  {} ({} tries, {}ms): {}",
                    attempt.relay,
                    attempt.tries,
                    attempt.elapsed_ms,
                    attempt.error.as_deref().unwrap_or("ok")
                );
            }
            let advice = if failure.kind.is_retryable() {
                "try again later"
            } else {
                "not retryable"
            };
            anyhow::bail!("Send failed, {advice}: {failure}")
        }
    }
}

fn print_status(report: &StatusReport) {
    println!(
        "{} relays, {} available, next send uses: {}",
        report.total,
        report.available,
        report.effective.as_deref().unwrap_or("none")
    );
    if let Some(preferred) = &report.preferred {
        println!("Pinned to: {preferred}");
    }

    println!();
    println!(
        "{:<16} {:>8} {:<32} {:<12} {:<10} {:>8}",
        "NAME", "PRIORITY", "ADDRESS", "ENCRYPTION", "STATE", "FAILURES"
    );
    for relay in &report.relays {
        let state = if relay.available {
            if relay.active { "active" } else { "ready" }
        } else {
            "cooling"
        };
        println!(
            "{:<16} {:>8} {:<32} {:<12} {:<10} {:>8}",
            relay.name,
            relay.priority,
            format!("{}:{}", relay.host, relay.port),
            relay.encryption.as_str(),
            state,
            relay.consecutive_failures
        );
        if !relay.available {
            println!("{:<16} cooldown {}s remaining", "", relay.cooldown_remaining_secs);
        }
        if let Some(error) = &relay.last_error {
            println!("{:<16} last error: {error}", "");
        }
    }
}

fn print_probes(reports: &[ProbeReport]) -> bool {
    let mut all_ok = true;
    for report in reports {
        if report.ok {
            println!("ok      {} ({}) {}ms", report.relay, report.address, report.elapsed_ms);
        } else {
            all_ok = false;
            println!(
                "FAILED  {} ({}) {}ms: {}",
                report.relay,
                report.address,
                report.elapsed_ms,
                report.error.as_deref().unwrap_or_default()
            );
        }
    }
    all_ok
}

async fn read_optional(path: Option<&PathBuf>) -> anyhow::Result<Option<String>> {
    match path {
        Some(path) => Ok(Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?,
        )),
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();
    let courier = load(&cli)?;

    match cli.command {
        Commands::Send {
            from,
            to,
            cc,
            bcc,
            reply_to,
            subject,
            body,
            body_file,
            html_file,
            attach,
        } => {
            let body = match body {
                Some(body) => body,
                None => read_optional(body_file.as_ref()).await?.unwrap_or_default(),
            };
            let request = SendRequest {
                from,
                to,
                cc,
                bcc,
                reply_to,
                subject,
                body,
                html: read_optional(html_file.as_ref()).await?,
                attachments: Vec::new(),
            };
            cmd_send(&courier, request, attach).await?;
        }
        Commands::Status { format } => {
            let report = courier.status();
            match format {
                OutputFormat::Text => print_status(&report),
                OutputFormat::Ron => println!(
                    "{}",
                    ron::ser::to_string_pretty(&report, ron::ser::PrettyConfig::default())?
                ),
            }
        }
        Commands::Check => {
            if !print_probes(&courier.check().await) {
                anyhow::bail!("One or more relays failed the check");
            }
        }
        Commands::Validate => {
            let status = courier.status();
            if status.total == 0 {
                anyhow::bail!("Configuration is valid but no relays are configured");
            }
            println!("Configuration is valid: {} relays", status.total);
            for relay in &status.relays {
                println!(
                    "  {} (priority {}) {}:{} {}{}",
                    relay.name,
                    relay.priority,
                    relay.host,
                    relay.port,
                    relay.encryption.as_str(),
                    relay
                        .username
                        .as_deref()
                        .map(|user| format!(" as {user}"))
                        .unwrap_or_default()
                );
            }
            if let Some(sender) = courier.default_sender() {
                println!("Default sender: {sender}");
            }
        }
    }

    Ok(())
}
