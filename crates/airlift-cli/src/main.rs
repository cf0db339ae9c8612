use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use airlift_core::{
    Engine, EngineConfig, EngineEvent, FixedProbe, Identity, PassiveRadio, SessionState,
    TransferPlan,
};

#[derive(Parser, Debug)]
#[command(name = "airlift", version, about = "Airlift local file sharing")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Data directory for identity and received files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the device identity
    Init {
        /// Name shown to nearby devices
        #[arg(long)]
        name: String,
    },

    /// Show device information
    Info,

    /// Discover nearby devices
    Discover {
        /// Discovery window in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send files to a discovered peer
    Send {
        /// Peer id as printed by `airlift discover`
        #[arg(long)]
        peer: String,

        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// How long to wait for the peer to appear, in seconds
        #[arg(long, default_value_t = 15)]
        wait: u64,
    },

    /// Advertise this device and accept incoming transfers
    Listen {
        /// Port to listen on (0 = OS-assigned)
        #[arg(long, default_value_t = 0)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".airlift")
    });

    match cli.cmd {
        Commands::Init { name } => init_device(&data_dir, &name),
        Commands::Info => show_info(&data_dir),
        Commands::Discover { timeout, json } => discover(&data_dir, timeout, json).await,
        Commands::Send { peer, files, wait } => send(&data_dir, &peer, &files, wait).await,
        Commands::Listen { port } => listen(&data_dir, port).await,
    }
}

fn init_device(data_dir: &PathBuf, name: &str) -> Result<()> {
    let config = EngineConfig::default()
        .with_data_dir(data_dir.clone())
        .with_device_name(name);
    config.ensure_data_dir()?;

    let identity = Identity::load_or_generate(&config.identity_path())?;

    let cfg_json = serde_json::to_string_pretty(&config)?;
    std::fs::write(data_dir.join("config.json"), cfg_json)?;

    println!("✓ Device initialized");
    println!("  Name: {}", name);
    println!("  Peer id: {}", identity.peer_id());
    println!("  Full fingerprint: {}", identity.full_fingerprint());
    println!("  Data directory: {}", data_dir.display());
    Ok(())
}

fn show_info(data_dir: &PathBuf) -> Result<()> {
    let config = load_config(data_dir)?;
    let identity = Identity::load(&config.identity_path())?;

    println!("Device information:");
    println!("  Name: {}", config.device_name);
    println!("  Peer id: {}", identity.peer_id());
    println!("  Full fingerprint: {}", identity.full_fingerprint());
    println!("  Data directory: {}", data_dir.display());
    println!("  Service type: {}", config.service_type);
    Ok(())
}

async fn discover(data_dir: &PathBuf, timeout: u64, json: bool) -> Result<()> {
    let engine = build_engine(load_config(data_dir)?)?;
    engine.start_discovery()?;
    tokio::time::sleep(Duration::from_secs(timeout)).await;

    let peers = engine.peers();
    engine.destroy();

    if json {
        let entries: Vec<_> = peers
            .iter()
            .map(|p| {
                serde_json::json!({
                    "id": p.id,
                    "name": p.display_name,
                    "address": p.discovery_address,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("Discovered {} device(s):", peers.len());
        for peer in peers {
            let addr = peer.discovery_address.as_deref().unwrap_or("radio only");
            println!("  {}  {}  ({})", peer.id, peer.display_name, addr);
        }
    }
    Ok(())
}

async fn send(data_dir: &PathBuf, peer: &str, files: &[PathBuf], wait: u64) -> Result<()> {
    let plan = TransferPlan::from_paths(files)?;
    println!(
        "Sending {} file(s), {} bytes total",
        plan.files.len(),
        plan.bytes_total()
    );

    let engine = build_engine(load_config(data_dir)?)?;
    engine.start_discovery()?;

    // The peer must be visible with a network endpoint before we dial.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    loop {
        let visible = engine
            .peers()
            .iter()
            .any(|p| p.id == peer && p.discovery_address.is_some());
        if visible {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            engine.destroy();
            anyhow::bail!("Peer {peer} not found within {wait}s");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let mut events = engine.subscribe();
    let session_id = engine.start_session(peer, plan)?;

    let mut outcome = None;
    while outcome.is_none() {
        match events.recv().await.context("engine event stream closed")? {
            EngineEvent::Progress(p) if p.session_id == session_id => {
                let pct = if p.bytes_total == 0 {
                    100
                } else {
                    p.bytes_sent * 100 / p.bytes_total
                };
                print!("\r  {pct:>3}% ({}/{} bytes)", p.bytes_sent, p.bytes_total);
                let _ = std::io::Write::flush(&mut std::io::stdout());
            }
            EngineEvent::SessionStateChanged { session_id: sid, state }
                if sid == session_id && state.is_terminal() =>
            {
                outcome = Some(state);
            }
            EngineEvent::NegotiationFailed { session_id: sid, message } if sid == session_id => {
                engine.destroy();
                anyhow::bail!("Negotiation failed: {message}");
            }
            EngineEvent::SessionFailed { session_id: sid, error } if sid == session_id => {
                eprintln!("\n✗ Transfer failed: {error}");
            }
            _ => {}
        }
    }
    engine.destroy();

    println!();
    match outcome {
        Some(SessionState::Completed) => {
            println!("✓ Transfer complete");
            Ok(())
        }
        Some(SessionState::Cancelled) => anyhow::bail!("Transfer cancelled"),
        _ => anyhow::bail!("Transfer failed"),
    }
}

async fn listen(data_dir: &PathBuf, port: u16) -> Result<()> {
    let mut config = load_config(data_dir)?;
    config.listen_port = port;

    let engine = build_engine(config)?;
    let bound = engine.start_receiving().await?;
    engine.start_discovery()?;

    println!("✓ Listening on port {bound} as {}", engine.peer_id());
    println!("  Received files go to {}", data_dir.join("incoming").display());
    println!("  Press Ctrl+C to stop");

    let mut events = engine.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(EngineEvent::ConsentRequested { session_id, peer_id, plan }) => {
                    println!(
                        "Incoming from {peer_id}: {} file(s), {} bytes",
                        plan.files.len(),
                        plan.bytes_total()
                    );
                    for file in &plan.files {
                        println!("  {} ({} bytes)", file.name, file.size);
                    }
                    engine.respond_to_consent(session_id, true);
                    println!("  accepted");
                }
                Ok(EngineEvent::SessionStateChanged { session_id, state }) if state.is_terminal() => {
                    println!("Session {session_id}: {state:?}");
                }
                Ok(EngineEvent::SessionFailed { session_id, error }) => {
                    eprintln!("✗ Session {session_id} failed: {error}");
                }
                Ok(EngineEvent::ReadinessChanged(state)) => {
                    eprintln!("✗ Transports no longer ready: {state:?}");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Event stream interrupted");
                }
            }
        }
    }

    engine.destroy();
    println!("Stopped");
    Ok(())
}

fn build_engine(config: EngineConfig) -> Result<Engine> {
    // No short-range radio bridge ships with the CLI; presence runs over
    // the local network only.
    Engine::create(
        config,
        Arc::new(PassiveRadio::default()),
        Arc::new(FixedProbe(true)),
    )
}

fn load_config(data_dir: &PathBuf) -> Result<EngineConfig> {
    let cfg_path = data_dir.join("config.json");
    if !cfg_path.exists() {
        anyhow::bail!("Device not initialized. Run 'airlift init' first.");
    }
    let cfg_json = std::fs::read_to_string(cfg_path)?;
    let config: EngineConfig = serde_json::from_str(&cfg_json)?;
    Ok(config)
}
