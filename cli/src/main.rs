// wps: command-line client for Web PubSub style services
//
// Connects with an access URL (from --url or the config file), then listens
// for group and server messages or sends a single message and reports its ack.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tracing::{debug, info};
use webpubsub_core::{
    ConnectionState, MessageData, SendEventOptions, SendResult, SendToGroupOptions,
    StaticUrlCredential, WebPubSubClient,
};

#[derive(Parser)]
#[command(name = "wps")]
#[command(about = "Web PubSub client: listen, publish and raise events", long_about = None)]
#[command(version)]
struct Cli {
    /// Client access URL (overrides the config file)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Subprotocol: `reliable` or `json` (overrides the config file)
    #[arg(long, global = true)]
    protocol: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print inbound messages until Ctrl-C
    Listen {
        /// Groups to join after connecting
        #[arg(short, long)]
        group: Vec<String>,
    },
    /// Publish one message to a group
    SendGroup {
        group: String,
        message: String,
        /// Treat the message as JSON
        #[arg(long)]
        json: bool,
        /// Do not echo the message back to this connection
        #[arg(long)]
        no_echo: bool,
        /// Do not wait for an ack
        #[arg(long)]
        fire_and_forget: bool,
    },
    /// Raise one event to the application server
    SendEvent {
        event: String,
        message: String,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        fire_and_forget: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all settings
    Show,
    /// Store the access URL
    SetUrl { url: String },
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Listen { ref group } => cmd_listen(&cli, group).await,
        Commands::SendGroup {
            ref group,
            ref message,
            json,
            no_echo,
            fire_and_forget,
        } => {
            let mut options = SendToGroupOptions::default();
            if no_echo {
                options = options.no_echo();
            }
            if fire_and_forget {
                options = options.fire_and_forget();
            }
            cmd_send_group(&cli, group, message, json, options).await
        }
        Commands::SendEvent {
            ref event,
            ref message,
            json,
            fire_and_forget,
        } => {
            let mut options = SendEventOptions::default();
            if fire_and_forget {
                options = options.fire_and_forget();
            }
            cmd_send_event(&cli, event, message, json, options).await
        }
        Commands::Config { ref action } => cmd_config(action),
    }
}

fn build_client(cli: &Cli) -> Result<WebPubSubClient> {
    let mut config = config::Config::load()?;
    if let Some(protocol) = &cli.protocol {
        config.protocol = protocol.clone();
    }
    let url = cli
        .url
        .clone()
        .or_else(|| config.url.clone())
        .context("No access URL. Pass --url or run `wps config set-url <url>`")?;

    let options = config.client_options()?;
    debug!("Using protocol {}", options.protocol.name());
    Ok(WebPubSubClient::new(StaticUrlCredential::new(url), options))
}

fn parse_data(message: &str, json: bool) -> Result<MessageData> {
    if json {
        let value = serde_json::from_str(message).context("Message is not valid JSON")?;
        Ok(MessageData::json(value))
    } else {
        Ok(MessageData::text(message))
    }
}

fn format_data(data: &MessageData) -> String {
    match data {
        MessageData::Json(value) => value.to_string(),
        MessageData::Text(text) => text.clone(),
        MessageData::Binary(bytes) => format!("<{} bytes binary>", bytes.len()),
        MessageData::Protobuf(bytes) => format!("<{} bytes protobuf>", bytes.len()),
    }
}

fn report(result: &SendResult) {
    match result.ack_id {
        Some(ack_id) if result.duplicated => {
            println!("{} Acked (ack id {}, duplicate)", "✓".green(), ack_id)
        }
        Some(ack_id) => println!("{} Acked (ack id {})", "✓".green(), ack_id),
        None => println!("{} Sent (no ack requested)", "✓".green()),
    }
}

async fn cmd_listen(cli: &Cli, groups: &[String]) -> Result<()> {
    let client = build_client(cli)?;

    client.on_connected(|event| {
        println!(
            "{} Connected as {}",
            "●".green(),
            event.connection_id.bright_cyan()
        );
    });
    client.on_disconnected(|event| {
        let reason = event.reason.as_deref().unwrap_or("unknown");
        if event.terminal {
            println!("{} Disconnected: {}", "●".red(), reason);
        } else {
            println!("{} Connection dropped: {}", "●".yellow(), reason);
        }
    });
    client.on_group_message(|event| {
        let from = event.from_user_id.as_deref().unwrap_or("anonymous");
        println!(
            "[{}] {}: {}",
            event.group.bright_cyan(),
            from.bold(),
            format_data(&event.data)
        );
    });
    client.on_server_message(|event| {
        println!("[{}] {}", "server".bright_magenta(), format_data(&event.data));
    });
    client.on_rejoin_group_failed(|event| {
        println!(
            "{} Could not rejoin {}: {}",
            "✗".red(),
            event.group.bright_cyan(),
            event.error
        );
    });

    client.start().await.context("Failed to connect")?;

    for group in groups {
        client
            .join_group(group)
            .await
            .with_context(|| format!("Failed to join group {}", group))?;
        println!("{} Joined {}", "✓".green(), group.bright_cyan());
    }

    println!("{}", "Listening. Press Ctrl-C to stop.".dimmed());
    let mut state = client.subscribe_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ConnectionState::Stopped {
                    break;
                }
            }
        }
    }

    info!("Listener shutting down");
    client.stop().await;
    Ok(())
}

async fn cmd_send_group(
    cli: &Cli,
    group: &str,
    message: &str,
    json: bool,
    options: SendToGroupOptions,
) -> Result<()> {
    let data = parse_data(message, json)?;
    let client = build_client(cli)?;
    client.start().await.context("Failed to connect")?;

    let result = client.send_to_group(group, data, options).await;
    client.stop().await;

    report(&result.with_context(|| format!("Failed to send to group {}", group))?);
    Ok(())
}

async fn cmd_send_event(
    cli: &Cli,
    event: &str,
    message: &str,
    json: bool,
    options: SendEventOptions,
) -> Result<()> {
    let data = parse_data(message, json)?;
    let client = build_client(cli)?;
    client.start().await.context("Failed to connect")?;

    let result = client.send_event(event, data, options).await;
    client.stop().await;

    report(&result.with_context(|| format!("Failed to send event {}", event))?);
    Ok(())
}

fn cmd_config(action: &ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }

            println!();
            println!(
                "  {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }

        ConfigAction::SetUrl { url } => {
            config.set("url", url)?;
            println!("{} Access URL saved", "✓".green());
        }

        ConfigAction::Set { key, value } => {
            config.set(key, value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
    }

    Ok(())
}
