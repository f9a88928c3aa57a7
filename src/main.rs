use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use anyhow::anyhow;
use axum_server::tls_rustls::RustlsConfig;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use persona_relay::{
    ServerConfig,
    client::{CallCommand, CallConfig, CallEvent, CallSession},
    core::audio::{AudioInput, AudioOutput, PacedOutput, SilenceInput, WavFileInput},
    core::conversation::ItemStatus,
    core::realtime::{RealtimeConfig, SessionControl, TurnDetectionConfig, create_upstream_session},
    routes,
    state::AppState,
};

/// Persona Relay - realtime voice relay and call client
#[derive(Parser, Debug)]
#[command(name = "persona-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run (defaults to `serve`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Serve,

    /// Place a call against the upstream or a relay
    Call(CallArgs),
}

#[derive(Args, Debug)]
struct CallArgs {
    /// WebSocket URL of the upstream or relay
    #[arg(long)]
    url: String,

    /// Mono 16-bit 24kHz WAV used as the microphone (silence if omitted)
    #[arg(long, value_name = "WAV")]
    input: Option<PathBuf>,

    /// Record assistant audio to this WAV file
    #[arg(long, value_name = "WAV")]
    output: Option<PathBuf>,

    /// Assistant voice
    #[arg(long, default_value = "coral")]
    voice: String,

    /// Assistant instructions
    #[arg(long, conflicts_with = "instructions_file")]
    instructions: Option<String>,

    /// Read assistant instructions from a file
    #[arg(long, value_name = "FILE")]
    instructions_file: Option<PathBuf>,

    /// First user message, sent once the call is connected
    #[arg(long)]
    message: Option<String>,

    /// Push-to-talk: turns are ended with `done` instead of server VAD
    #[arg(long)]
    manual: bool,

    /// API key when calling the upstream directly (defaults to OPENAI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Upstream readiness timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    connect_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.config).await,
        Commands::Call(args) => call(args).await,
    }
}

async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    // Load configuration from file or environment
    let config = if let Some(config_path) = config_path {
        println!("Loading configuration from {}", config_path.display());
        ServerConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    if config.openai_api_key.is_none() {
        warn!("OPENAI_API_KEY is not set; every session will fail to reach the upstream");
    }

    let address = config.address();
    let tls_config = config.tls.clone();
    info!(
        relay_path = %config.relay_path,
        upstream = %config.upstream_url,
        connect_timeout_ms = config.connect_timeout_ms,
        "Relay configured"
    );

    let app_state = AppState::new(config).await;
    let app = routes::create_app_router(app_state);

    // Parse socket address
    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    // Start server with or without TLS
    if let Some(tls) = tls_config {
        let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to load TLS certificates from {} and {}: {}",
                    tls.cert_path.display(),
                    tls.key_path.display(),
                    e
                )
            })?;

        println!("Relay listening on wss://{} (TLS enabled)", socket_addr);

        axum_server::bind_rustls(socket_addr, rustls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| anyhow!("TLS server error: {}", e))?;
    } else {
        println!("Relay listening on ws://{}", socket_addr);

        let listener = TcpListener::bind(&socket_addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
    }

    Ok(())
}

async fn call(args: CallArgs) -> anyhow::Result<()> {
    let instructions = match (&args.instructions, &args.instructions_file) {
        (Some(text), _) => Some(text.clone()),
        (None, Some(path)) => Some(std::fs::read_to_string(path).map_err(|e| {
            anyhow!("Failed to read instructions file {}: {}", path.display(), e)
        })?),
        (None, None) => None,
    };

    let mut control = SessionControl::persona_defaults();
    control.voice = Some(args.voice.clone());
    control.instructions = instructions;
    if args.manual {
        control.turn_detection = TurnDetectionConfig::Disabled;
    }

    let upstream = create_upstream_session(RealtimeConfig {
        url: args.url.clone(),
        api_key: args
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok()),
        model: None,
    })
    .map_err(|e| anyhow!("Cannot set up call: {}", e))?;

    let input: Box<dyn AudioInput> = match &args.input {
        Some(path) => Box::new(
            WavFileInput::open(path)
                .map_err(|e| anyhow!("Cannot open {}: {}", path.display(), e))?,
        ),
        None => Box::new(SilenceInput),
    };
    let output: Box<dyn AudioOutput> = match &args.output {
        Some(path) => Box::new(
            PacedOutput::wav(path).map_err(|e| anyhow!("Cannot create {}: {}", path.display(), e))?,
        ),
        None => Box::new(PacedOutput::discard()),
    };

    let config = CallConfig {
        control,
        initial_message: args.message.clone(),
        connect_timeout: Duration::from_millis(args.connect_timeout_ms),
    };
    let (session, mut events) = CallSession::new(upstream, input, output, config);
    let (commands, commands_rx) = mpsc::channel(32);

    // stdin line commands
    let stdin_commands = commands.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match CallCommand::parse(&line) {
                Some(command) => {
                    if stdin_commands.send(command).await.is_err() {
                        break;
                    }
                }
                None => eprintln!("commands: mute | unmute | say <text> | talk | done | hangup"),
            }
        }
    });

    // Ctrl-C hangs up
    let signal_commands = commands.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_commands.send(CallCommand::HangUp).await;
        }
    });
    drop(commands);

    let call = tokio::spawn(session.run(commands_rx));

    let mut failed = None;
    while let Some(event) = events.recv().await {
        match event {
            CallEvent::StateChanged(state) => println!("[call] {state}"),
            CallEvent::ItemUpdated(item) if item.status != ItemStatus::InProgress => {
                let text = item.text();
                if !text.is_empty() {
                    println!("{}: {}", item.role, text);
                }
            }
            CallEvent::ItemUpdated(_) => {}
            CallEvent::Interrupted { track_id, offset } => {
                println!("[call] interrupted {track_id} at sample {offset}");
            }
            CallEvent::Error(e) => {
                eprintln!("[call] error: {e}");
                if e.is_fatal() {
                    failed = Some(e);
                }
            }
            CallEvent::Ended { transcript } => {
                println!("\n--- transcript ---\n{transcript}");
            }
        }
    }

    call.await.map_err(|e| anyhow!("Call task failed: {}", e))?;

    match failed {
        Some(e) => Err(anyhow!("Call ended with error: {}", e)),
        None => Ok(()),
    }
}
