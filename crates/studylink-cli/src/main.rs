//! StudyLink CLI
//!
//! Thin wrapper around studylink-core for running study sessions from a
//! terminal.
//!
//! ## Usage
//!
//! ```bash
//! # Run a rendezvous service and print its ticket
//! studylink rendezvous
//!
//! # Host a session (prints the six-digit room code)
//! studylink host --rendezvous <ticket>
//!
//! # Join a session by code
//! studylink join 123456 --rendezvous <ticket>
//! ```
//!
//! Inside a session, plain text is sent as chat. Type `/help` for the
//! other commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use studylink_core::{
    ChatSender, CountingSink, IrohTransport, RendezvousServer, RendezvousTicket, RoomCode,
    SessionConfig, SessionController, SessionNotice, SignalingTransport, SilenceCapture,
    SpeakerRouting, ToolKind, ToolSnapshot,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing::debug;

/// StudyLink - two-party study sessions
#[derive(Parser)]
#[command(name = "studylink")]
#[command(version = "0.1.0")]
#[command(about = "StudyLink - two-party study sessions with chat, shared tools and voice")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Seconds to wait when joining a session
    #[arg(long, global = true, default_value_t = 10)]
    connect_timeout: u64,

    /// Seconds an outgoing call may ring
    #[arg(long, global = true, default_value_t = 30)]
    call_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a rendezvous service that maps room codes to endpoints
    Rendezvous,

    /// Host a new session
    Host {
        /// Rendezvous ticket (studylink-rdv:...)
        #[arg(short, long, env = "STUDYLINK_RENDEZVOUS")]
        rendezvous: String,
    },

    /// Join a session by its room code
    Join {
        /// Six-digit room code from the host
        code: String,

        /// Rendezvous ticket (studylink-rdv:...)
        #[arg(short, long, env = "STUDYLINK_RENDEZVOUS")]
        rendezvous: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Parse a rendezvous ticket from its string form
fn parse_ticket(s: &str) -> Result<RendezvousTicket> {
    RendezvousTicket::decode(s.trim())
        .map_err(|e| anyhow::anyhow!("Invalid rendezvous ticket: {}", e))
}

/// Parse a room code, before any network activity
fn parse_code(s: &str) -> Result<RoomCode> {
    RoomCode::parse(s).map_err(|e| anyhow::anyhow!("{}", e))
}

/// Bind an endpoint at the rendezvous service and wrap it in a controller
async fn open_controller(ticket: &RendezvousTicket, config: SessionConfig) -> Result<SessionController> {
    let (transport, events) = IrohTransport::open(ticket, config.registration_attempts)
        .await
        .context("Failed to register with the rendezvous service")?;
    debug!(code = %transport.local_code(), "Endpoint ready");

    Ok(SessionController::new(
        Arc::new(transport),
        events,
        Arc::new(SilenceCapture::new()),
        Arc::new(CountingSink::new()),
        config,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = SessionConfig::new()
        .with_connect_timeout(Duration::from_secs(cli.connect_timeout))
        .with_call_timeout(Duration::from_secs(cli.call_timeout));

    match cli.command {
        Commands::Rendezvous => {
            let server = RendezvousServer::spawn().await?;

            println!("StudyLink rendezvous service");
            println!();
            println!("Ticket:");
            println!("  {}", server.ticket());
            println!();
            println!("Pass it with --rendezvous or STUDYLINK_RENDEZVOUS. Press Ctrl+C to stop.");

            let mut status = tokio::time::interval(Duration::from_secs(60));
            status.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    _ = status.tick() => {
                        println!("[Status] {} active room(s)", server.registry().len());
                    }
                }
            }

            server.shutdown().await;
            println!("Goodbye.");
        }

        Commands::Host { rendezvous } => {
            let ticket = parse_ticket(&rendezvous)?;
            let mut controller = open_controller(&ticket, config).await?;
            let code = controller.create_session()?;

            println!("Hosting session");
            println!("  Room code: {}", code);
            println!();
            println!("Share the code with your study partner. Type /help for commands.");

            run_session(&mut controller).await?;
        }

        Commands::Join { code, rendezvous } => {
            let code = parse_code(&code)?;
            let ticket = parse_ticket(&rendezvous)?;
            let mut controller = open_controller(&ticket, config).await?;

            println!("Joining session {}...", code);
            controller.join_session(code.as_str()).await?;
            println!("Connected. Type /help for commands.");

            run_session(&mut controller).await?;
        }
    }

    Ok(())
}

/// What the loop should do after a line of input
enum Flow {
    Continue,
    Quit,
}

/// Interactive loop: stdin commands, notices and controller events
async fn run_session(controller: &mut SessionController) -> Result<()> {
    let mut notices = controller.subscribe_notices();
    let stdin = tokio::io::stdin();
    let reader = tokio::io::BufReader::new(stdin);
    let mut lines = reader.lines();

    let mut shown = controller.session().messages.len();

    println!("{}", "─".repeat(50));

    loop {
        tokio::select! {
            alive = controller.next_event() => {
                if !alive {
                    println!("Session closed.");
                    break;
                }
                shown = print_new_messages(controller, shown);
            }
            notice = notices.recv() => {
                match notice {
                    Ok(notice) => print_notice(&notice),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "Notice receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        match handle_line(controller, text.trim()).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Quit) => break,
                            Err(e) => eprintln!("Error: {}", e),
                        }
                    }
                    Ok(None) => {
                        // EOF - stdin closed
                        println!();
                        println!("Input closed, exiting...");
                        break;
                    }
                    Err(e) => {
                        eprintln!("Read error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Exiting session...");
                break;
            }
        }
    }

    controller.destroy_session().await;
    println!("Goodbye.");
    Ok(())
}

fn print_notice(notice: &SessionNotice) {
    match notice {
        // chat lines are printed from the session log
        SessionNotice::UnreadChat { .. } => {}
        other if other.is_error() => eprintln!("! {}", other),
        other => println!("* {}", other),
    }
}

/// Print partner lines appended since `shown`; returns the new log length
fn print_new_messages(controller: &SessionController, shown: usize) -> usize {
    let messages = &controller.session().messages;
    // the log resets when the session does
    let start = if shown > messages.len() { 0 } else { shown };
    for entry in &messages[start..] {
        if entry.sender == ChatSender::Peer {
            println!("Partner: {}", entry.text);
        }
    }
    messages.len()
}

async fn handle_line(controller: &mut SessionController, line: &str) -> Result<Flow> {
    if line.is_empty() {
        return Ok(Flow::Continue);
    }

    let Some(command) = line.strip_prefix('/') else {
        controller.send_chat(line)?;
        return Ok(Flow::Continue);
    };

    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();

    match name {
        "help" => print_help(),
        "call" => {
            controller.initiate_call().await?;
            println!("Calling...");
        }
        "accept" => controller.accept_call().await?,
        "reject" => controller.reject_call()?,
        "hangup" => controller.end_call()?,
        "mute" => {
            let muted = controller.toggle_mute()?;
            println!("Microphone {}", if muted { "muted" } else { "live" });
        }
        "speaker" => {
            let routing = controller.toggle_speaker();
            let on = controller.session().speaker_on;
            match routing {
                SpeakerRouting::Applied => {
                    println!("Speaker {}", if on { "on" } else { "off" })
                }
                SpeakerRouting::PreferenceOnly => println!(
                    "Speaker preference {} (this device cannot switch output)",
                    if on { "on" } else { "off" }
                ),
            }
        }
        "tool" => {
            let tool = match rest {
                "" | "none" => None,
                kind => Some(kind.parse::<ToolKind>().map_err(|e| anyhow::anyhow!(e))?),
            };
            let sent = controller.set_foreground_tool(tool);
            debug!(?tool, sent, "Foreground tool changed");
        }
        "publish" => {
            let (kind, json) = rest
                .split_once(' ')
                .context("Usage: /publish <tool> <json>")?;
            let kind: ToolKind = kind.parse::<ToolKind>().map_err(|e| anyhow::anyhow!(e))?;
            let payload: serde_json::Value =
                serde_json::from_str(json).context("Snapshot is not valid JSON")?;
            let snapshot = ToolSnapshot::from_payload(kind, payload)
                .with_context(|| format!("Snapshot does not match the {} tool", kind))?;
            if controller.publish_tool_state(snapshot) {
                println!("Sent {} state", kind);
            } else {
                println!("Stored {} state (not in the foreground or not connected)", kind);
            }
        }
        "chat" => match rest {
            "on" => controller.set_chat_visible(true),
            "off" => controller.set_chat_visible(false),
            _ => anyhow::bail!("Usage: /chat on|off"),
        },
        "status" => print_status(controller),
        "leave" => {
            controller.leave_session();
            return Ok(Flow::Quit);
        }
        "quit" => return Ok(Flow::Quit),
        other => anyhow::bail!("Unknown command '/{}'. Type /help for commands.", other),
    }

    Ok(Flow::Continue)
}

fn print_status(controller: &SessionController) {
    let session = controller.session();

    println!("Session:");
    match &session.room_id {
        Some(room) => println!("  Room: {} ({})", room, if session.is_host { "host" } else { "guest" }),
        None => println!("  Room: (none)"),
    }
    if let Some(code) = controller.local_code() {
        println!("  Local code: {}", code);
    }
    match &session.peer {
        Some(peer) if session.connected => println!("  Partner: {} (connected)", peer),
        _ => println!("  Partner: (not connected)"),
    }
    println!("  Messages: {}", session.messages.len());
    println!("  Call: {}", session.call_state);
    if !session.call_state.is_idle() {
        println!("  Muted: {}", session.muted);
    }
    println!("  Speaker: {}", if session.speaker_on { "on" } else { "off" });
    match controller.foreground_tool() {
        Some(tool) => println!("  Foreground tool: {}", tool),
        None => println!("  Foreground tool: (none)"),
    }
    for kind in ToolKind::ALL {
        if controller.tool_state(kind).is_some() {
            println!("  Has {} state", kind);
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  <text>                  send a chat message");
    println!("  /call                   call your partner");
    println!("  /accept, /reject        answer or decline an incoming call");
    println!("  /hangup                 end the call");
    println!("  /mute, /speaker         toggle microphone or speaker");
    println!("  /tool <kind>|none       set the foreground tool");
    println!("  /publish <kind> <json>  share a tool snapshot");
    println!("  /chat on|off            whether the chat view is visible");
    println!("  /status                 show session state");
    println!("  /leave                  leave the session");
    println!("  /quit                   exit");
    println!();
    println!(
        "Tools: {}",
        ToolKind::ALL.map(|k| k.as_str()).join(", ")
    );
}
