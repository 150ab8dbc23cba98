//! Command-line meeting client
//!
//! Joins a room through the WebSocket relay and drives the session from
//! stdin. Meeting events are printed one JSON object per line.
//!
//! # Usage
//!
//! ```bash
//! meeting_client --origin https://meet.example.com --room standup
//!
//! # Room taken from the page path, relay-capable ICE
//! meeting_client --origin http://localhost:8000 \
//!   --page-path /projects/42/meeting/standup \
//!   --turn-servers 'turn:turn.example.com:3478|alice|secret'
//! ```
//!
//! Commands: `mute`, `video`, `share`, `unshare`, `chat <text>`, `peers`,
//! `retry <client-id>`, `quit`.

use anyhow::{bail, Context};
use clap::Parser;
use meeting_rtc::{
    ClientId, ExternalCaptureDevices, GlareStrategy, MeetingConfig, MeetingEvent, MeetingSession,
    RoomName, TurnServerConfig, WebRtcEngine, WebSocketConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mesh WebRTC meeting client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Origin of the meeting page; the relay URL mirrors it
    #[arg(long, env = "MEETING_ORIGIN")]
    origin: Option<String>,

    /// Room to join
    #[arg(long, env = "MEETING_ROOM", conflicts_with = "page_path")]
    room: Option<String>,

    /// Meeting page path; the last segment names the room
    #[arg(long, env = "MEETING_PAGE_PATH")]
    page_path: Option<String>,

    /// TOML config file; command-line flags override it
    #[arg(long, env = "MEETING_CONFIG")]
    config: Option<PathBuf>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "MEETING_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// TURN servers (format: url|username|credential, comma-separated)
    #[arg(long, value_delimiter = ',', env = "MEETING_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Join without a camera
    #[arg(long, default_value_t = false)]
    audio_only: bool,

    /// Glare resolution: perfect_negotiation (default) or last_offer_wins
    #[arg(long, env = "MEETING_GLARE")]
    glare: Option<GlareStrategy>,

    /// Log as JSON lines
    #[arg(long, default_value_t = false, env = "MEETING_LOG_JSON")]
    log_json: bool,
}

fn build_config(args: &Args) -> anyhow::Result<MeetingConfig> {
    let mut config = match &args.config {
        Some(path) => MeetingConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => MeetingConfig::default(),
    };

    if let Some(origin) = &args.origin {
        config.server_origin = origin.clone();
    }
    if !args.stun_servers.is_empty() {
        config.stun_servers = args.stun_servers.clone();
    }
    for spec in &args.turn_servers {
        let turn = TurnServerConfig::parse_cli(spec)?;
        info!("Adding TURN server: {} (user: {})", turn.url, turn.username);
        config.turn_servers.push(turn);
    }
    if args.audio_only {
        config.media.video = false;
    }
    if let Some(glare) = args.glare {
        config.glare = glare;
    }

    config.validate()?;
    Ok(config)
}

fn room_from_args(args: &Args) -> anyhow::Result<RoomName> {
    match (&args.room, &args.page_path) {
        (Some(room), _) => Ok(RoomName::new(room.as_str())?),
        (None, Some(path)) => Ok(RoomName::from_page_path(path)?),
        (None, None) => bail!("either --room or --page-path is required"),
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meeting_rtc=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_event(event: &MeetingEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to render event: {}", e),
    }
}

/// Run one stdin command. Returns false on `quit`.
async fn run_command(session: &MeetingSession, line: &str) -> anyhow::Result<bool> {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    match command {
        "" => {}
        "mute" => {
            let enabled = session.toggle_audio().await?;
            println!("audio {}", if enabled { "on" } else { "off" });
        }
        "video" => {
            let enabled = session.toggle_video().await?;
            println!("video {}", if enabled { "on" } else { "off" });
        }
        "share" => session.start_screen_share().await?,
        "unshare" => session.stop_screen_share().await?,
        "chat" => {
            if rest.is_empty() {
                bail!("usage: chat <text>");
            }
            session.send_chat(rest).await?;
        }
        "peers" => {
            println!(
                "{} participant(s) in {}",
                session.participant_count(),
                session.room()
            );
            for peer in session.participants() {
                println!("{}", serde_json::to_string(&peer)?);
            }
        }
        "retry" => {
            if rest.is_empty() {
                bail!("usage: retry <client-id>");
            }
            session.retry_peer(&ClientId::from(rest)).await?;
        }
        "quit" | "exit" => return Ok(false),
        other => bail!("unknown command: {}", other),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = build_config(&args)?;
    let room = room_from_args(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        origin = %config.server_origin,
        room = %room,
        "Meeting client starting"
    );

    let engine = Arc::new(WebRtcEngine::new()?);
    let devices = Arc::new(ExternalCaptureDevices {
        camera: config.media.video,
        ..Default::default()
    });
    let mut session =
        MeetingSession::join(config, room, engine, devices, &WebSocketConnector::new())
            .await
            .context("Failed to join meeting")?;
    println!("joined as {}", session.client_id());

    let mut events = session
        .take_events()
        .context("event stream already taken")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, leaving");
                break;
            }
            Some(event) = events.recv() => print_event(&event),
            line = lines.next_line() => match line? {
                Some(line) => match run_command(&session, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("error: {:#}", e),
                },
                None => break,
            },
        }
    }

    session.leave().await?;
    info!("Left meeting");
    Ok(())
}
