use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use twain::cli::{Cli, Commands};
use twain::commands::{self, Session};
use twain::domain::{CharsetOptions, ProtocolConfig, SecretId};

/// Logs go to stderr so stdout only ever carries command output
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Writes a recovered secret to stdout
fn print_secret(secret: &str) -> Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{secret}").context("Failed to write secret to stdout")?;
    stdout.flush().context("Failed to flush stdout")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = ProtocolConfig::new().with_max_request_age(cli.max_request_age);
    let name = match &cli.command {
        Commands::Init { name } => name.as_str(),
        _ => "unnamed device",
    };
    let mut session = Session::open(&cli.store, &cli.relay, name, config)?;

    match cli.command {
        Commands::Init { .. } => {
            let device_id = commands::init(&mut session).await?;
            println!("{device_id}");
        }
        Commands::Devices => {
            for device in commands::list_devices(&mut session).await? {
                let marker = if device.is_self { " (this device)" } else { "" };
                println!("{}  {}{marker}", device.device_id, device.display_name);
            }
        }
        Commands::Create { title, with } => {
            let secret_id = commands::create_secret(&mut session, &title, &with).await?;
            println!("{secret_id}");
        }
        Commands::List => {
            for (secret_id, title) in commands::list_secrets(&session) {
                println!("{secret_id}  {title}");
            }
        }
        Commands::Sync => {
            let summary = commands::sync(&mut session).await?;
            eprintln!(
                "{} new device(s), {} new share(s), {} new request(s), {} response(s) ready",
                summary.identities.added.len(),
                summary.received.len(),
                summary.reassembly.incoming.len(),
                summary.reassembly.filled.len(),
            );
        }
        Commands::Request { secret_id } => {
            let request_id = commands::request(&mut session, secret_id).await?;
            println!("{request_id}");
        }
        Commands::Pending => {
            let pending = commands::pending(&mut session).await?;
            let title = |id: &SecretId| {
                session
                    .manager()
                    .secret(id)
                    .map_or("?", |s| s.title.as_str())
                    .to_string()
            };
            for request in &pending.incoming {
                println!(
                    "request   {}  from {}  for \"{}\"",
                    request.uuid,
                    request.requester,
                    title(&request.secret_id)
                );
            }
            for request in &pending.waiting {
                println!(
                    "waiting   {}  for \"{}\"",
                    request.uuid,
                    title(&request.secret_id)
                );
            }
            for filled in &pending.ready {
                println!(
                    "ready     {}  from {}  for \"{}\"",
                    filled.response.uuid,
                    filled.response.responder,
                    title(&filled.request.secret_id)
                );
            }
        }
        Commands::Respond { request_id } => {
            let response_id = commands::respond(&mut session, request_id).await?;
            println!("{response_id}");
        }
        Commands::Finish {
            response_id,
            charset,
        } => {
            let secret =
                commands::finish(&mut session, response_id, CharsetOptions::from(charset)).await?;
            print_secret(&secret)?;
        }
    }

    Ok(())
}
