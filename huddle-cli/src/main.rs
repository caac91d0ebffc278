//! Huddle CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use console::ConsoleCommand;
use huddle_core::prelude::*;
use huddle_core::ws::{channel_url, dm_url};
use huddle_core::{decode_frame, dm_room, InboundFrame, RelayChannel, WsSignalingChannel};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

mod console;
#[cfg(test)]
mod console_tests;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// User name announced when calling (random if unset)
    #[arg(short, long, env = "HUDDLE_USER")]
    user: Option<String>,

    /// Call configuration file (JSON)
    #[arg(short, long, env = "HUDDLE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Audio,
    Video,
}

impl From<ModeArg> for CallMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Audio => CallMode::Audio,
            ModeArg::Video => CallMode::Video,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call between two in-process members of a conversation
    Loopback {
        /// Call type
        #[arg(long, value_enum, default_value = "video")]
        mode: ModeArg,

        /// Have the callee decline instead of accepting
        #[arg(long)]
        decline: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value_t = 3)]
        hold_secs: u64,

        /// Use host candidates only
        #[arg(long)]
        no_stun: bool,
    },

    /// Join a conversation on a chat server
    Attach {
        /// Server base URL (e.g. ws://localhost:8000)
        server: String,

        /// Workspace channel id
        #[arg(long, conflicts_with = "dm", required_unless_present = "dm")]
        channel: Option<String>,

        /// Direct-message group id
        #[arg(long)]
        dm: Option<String>,

        /// Session token
        #[arg(long, env = "HUDDLE_TOKEN")]
        token: String,

        /// Start a call as soon as the conversation is joined
        #[arg(long, value_enum)]
        call: Option<ModeArg>,

        /// Accept incoming calls without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// Decode a conversation frame
    Inspect {
        /// Frame text (JSON)
        frame: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("huddle=info,huddle_core=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Loopback {
            mode,
            decline,
            hold_secs,
            no_stun,
        } => {
            let mut config = load_config(cli.config.as_deref(), cli.user)?;
            if no_stun {
                config.ice_servers.clear();
            }
            handle_loopback(config, mode.into(), decline, Duration::from_secs(hold_secs)).await?;
        }
        Commands::Attach {
            server,
            channel,
            dm,
            token,
            call,
            auto_accept,
        } => {
            let config = load_config(cli.config.as_deref(), cli.user)?;
            let url = match (channel, dm) {
                (Some(channel), _) => channel_url(&server, &channel, &token),
                (None, Some(group)) => dm_url(&server, &group, &token),
                (None, None) => bail!("either --channel or --dm is required"),
            };
            handle_attach(config, &url, call.map(CallMode::from), auto_accept).await?;
        }
        Commands::Inspect { frame } => {
            handle_inspect(&frame)?;
        }
    }

    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("chat", "huddle", "huddle")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

/// Explicit config file, else the per-user one if present, else defaults
fn load_config(path: Option<&Path>, user: Option<String>) -> Result<CallConfig> {
    let mut config = match path {
        Some(path) => CallConfig::from_json_file(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Using per-user configuration");
                CallConfig::from_json_file(&path)?
            }
            None => CallConfig::default(),
        },
    };
    if let Some(user) = user {
        config.local_user = user;
    } else if config.local_user == CallConfig::default().local_user {
        config.local_user = console::random_user_name();
    }
    Ok(config)
}

fn spawn_member(
    relay: &Arc<SignalingRelay>,
    room: &str,
    config: CallConfig,
) -> Result<Arc<CallService<RelayChannel>>> {
    let signaling = Arc::new(SignalingHandler::new(Arc::new(relay.join(room))));
    let service = Arc::new(CallService::builder(signaling).with_config(config).build()?);
    let runner = Arc::clone(&service);
    tokio::spawn(async move { runner.run().await });
    Ok(service)
}

fn print_events(label: &'static str, mut events: broadcast::Receiver<ConversationEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = console::describe(&event) {
                        println!("[{label}] {line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_event(
    events: &mut broadcast::Receiver<ConversationEvent>,
    within: Duration,
    what: &str,
    matches: impl Fn(&ConversationEvent) -> bool,
) -> Result<ConversationEvent> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Ok(event),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("conversation closed while waiting for {what}"),
            }
        }
    };
    tokio::time::timeout(within, wait)
        .await
        .with_context(|| format!("timed out waiting for {what}"))?
}

async fn handle_loopback(
    config: CallConfig,
    mode: CallMode,
    decline: bool,
    hold: Duration,
) -> Result<()> {
    let relay = SignalingRelay::new();
    let room = dm_room("loopback");

    let callee_config = CallConfig {
        local_user: format!("{}-peer", config.local_user),
        ..config.clone()
    };
    println!(
        "📞 {} calls {} in {} ({})",
        config.local_user, callee_config.local_user, room, mode
    );

    let caller = spawn_member(&relay, &room, config)?;
    let callee = spawn_member(&relay, &room, callee_config)?;
    print_events("caller", caller.subscribe_events());
    print_events("callee", callee.subscribe_events());
    let mut caller_events = caller.subscribe_events();
    let mut callee_events = callee.subscribe_events();

    caller.start_call(mode).await?;
    wait_event(&mut callee_events, Duration::from_secs(10), "the offer", |event| {
        matches!(event, ConversationEvent::IncomingCall { ready: true, .. })
    })
    .await?;

    if decline {
        callee.decline()?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        println!("caller is still {}; hanging up", caller.status());
        caller.end_call().await?;
        return Ok(());
    }

    callee.accept().await?;
    wait_event(&mut caller_events, Duration::from_secs(15), "the answer", |event| {
        matches!(
            event,
            ConversationEvent::Call(CallEvent::StatusChanged {
                new: CallStatus::Active,
                ..
            })
        )
    })
    .await?;

    tokio::time::sleep(hold).await;
    let muted = !caller.toggle_mute()?;
    println!("caller muted: {muted}");
    println!("{}", serde_json::to_string_pretty(&caller.snapshot())?);

    caller.end_call().await?;
    wait_event(&mut callee_events, Duration::from_secs(5), "the hangup", |event| {
        matches!(event, ConversationEvent::Call(CallEvent::CallEnded { .. }))
    })
    .await?;
    println!("✅ loopback call complete");
    Ok(())
}

async fn execute<C: SignalingChannel>(
    service: &CallService<C>,
    command: ConsoleCommand,
) -> Result<(), CallError> {
    match command {
        ConsoleCommand::Call(mode) => {
            let call_id = service.start_call(mode).await?;
            println!("calling ({call_id})");
        }
        ConsoleCommand::Accept => {
            service.accept().await?;
        }
        ConsoleCommand::Decline => service.decline()?,
        ConsoleCommand::Hangup => service.end_call().await?,
        ConsoleCommand::Mute => {
            service.toggle_mute()?;
        }
        ConsoleCommand::Video => {
            service.toggle_video()?;
        }
        ConsoleCommand::Status => match serde_json::to_string_pretty(&service.snapshot()) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::warn!(error = %e, "Snapshot not printable"),
        },
        ConsoleCommand::Help => println!("{}", console::HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

async fn handle_attach(
    config: CallConfig,
    url: &str,
    call: Option<CallMode>,
    auto_accept: bool,
) -> Result<()> {
    let channel = WsSignalingChannel::connect(url)
        .await
        .context("connecting to the conversation socket")?;
    println!("🔗 joined as {}", config.local_user);

    let signaling = Arc::new(SignalingHandler::new(Arc::new(channel)));
    let service = Arc::new(CallService::builder(signaling).with_config(config).build()?);
    let mut events = service.subscribe_events();
    let runner = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.run().await })
    };

    if let Some(mode) = call {
        execute(&service, ConsoleCommand::Call(mode)).await?;
    }
    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = console::describe(&event) {
                        println!("{line}");
                    }
                    match event {
                        ConversationEvent::IncomingCall { ready: true, .. } if auto_accept => {
                            if let Err(e) = service.accept().await {
                                println!("❌ {e}");
                            }
                        }
                        ConversationEvent::ChannelClosed => break,
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Console lagged behind conversation events");
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => match ConsoleCommand::parse(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = execute(&service, command).await {
                            println!("❌ {e}");
                        }
                    }
                    Err(e) => println!("{e}"),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if !service.status().is_idle() {
        let _ = service.end_call().await;
    }
    runner.abort();
    Ok(())
}

fn handle_inspect(frame: &str) -> Result<()> {
    let decoded = decode_frame(frame).context("not a conversation frame")?;
    println!("{}", console::classify(&decoded));
    match decoded {
        InboundFrame::Signaling(message) => {
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        InboundFrame::Chat(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        InboundFrame::MalformedSignaling { .. } | InboundFrame::RelayError(_) => {}
    }
    Ok(())
}
