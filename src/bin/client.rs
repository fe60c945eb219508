//! roomdrop client: send a file through a fresh room, or join a room
//! link and receive one.

use clap::{Parser, Subcommand};
use roomdrop::core::config::RuntimeConfig;
use roomdrop::core::peer::webrtc::WebRtcTransportFactory;
use roomdrop::core::ports::{FileSource, Presenter, ReceivedFile};
use roomdrop::core::session::{Role, Session, SessionParams};
use roomdrop::core::signaling_client::{ws_url, SignalingClient};
use roomdrop::core::transfer::blob::{sanitize_file_name, DiskFileSource, SaveDirProvider};
use roomdrop::core::transfer::progress::ProgressReport;
use roomdrop::utils::ids::{is_valid_room_id, secure_id};
use roomdrop::utils::sos::SignalOfStop;
use serde::Deserialize;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// roomdrop - direct peer-to-peer file transfer via a room link.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
struct Args {
    /// Signaling server base URL.
    #[clap(long)]
    server: Option<String>,

    /// Directory where received files land. Defaults to the system
    /// download directory.
    #[clap(long)]
    downloads: Option<PathBuf>,

    /// Auto-approve incoming join requests.
    #[clap(short = 'y', long)]
    yes: bool,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a room, print the share link, and send FILE once a
    /// receiver is approved.
    Send { file: PathBuf },
    /// Join ROOM (a room id or a full share link) and receive the file.
    Receive { room: String },
}

/// Optional `config.toml` next to the binary; CLI flags win.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    server: Option<String>,
    downloads: Option<PathBuf>,
}

impl FileConfig {
    fn load() -> Self {
        std::fs::read_to_string("config.toml")
            .ok()
            .and_then(|text| toml::from_str(&text).ok())
            .unwrap_or_default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let file_config = FileConfig::load();
    let server = args
        .server
        .or(file_config.server)
        .unwrap_or_else(|| "http://localhost:8080".to_string());
    let downloads = args
        .downloads
        .or(file_config.downloads)
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    let sos = SignalOfStop::new();
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    let runtime = fetch_runtime_config(&server).await;
    let presenter = Arc::new(TerminalPresenter::new(args.yes, downloads.clone()));
    let factory = Arc::new(WebRtcTransportFactory::new(
        runtime.ice_servers.clone(),
        runtime.buffer_low_water,
    ));
    let sinks = Arc::new(SaveDirProvider::new(downloads));

    let (role, room_id, file) = match &args.command {
        Command::Send { file } => {
            let source = DiskFileSource::open(file).await?;
            if runtime.max_file_size > 0 && source.len() > runtime.max_file_size {
                anyhow::bail!(
                    "{} is larger than the server's {} byte limit",
                    file.display(),
                    runtime.max_file_size
                );
            }
            let source: Arc<dyn FileSource> = Arc::new(source);
            (Role::Sender, secure_id(), Some(source))
        }
        Command::Receive { room } => {
            let room_id = parse_room(room)?;
            (Role::Receiver, room_id, None)
        }
    };

    let (signaling, notices) = SignalingClient::start(ws_url(&server), sos.clone());
    let session = Session::new(
        SessionParams {
            role,
            room_id,
            base_url: server.trim_end_matches('/').to_string(),
            file,
            presenter,
            sinks,
            factory,
            runtime,
            sos,
        },
        signaling,
        notices,
    );
    session.run().await?;
    Ok(())
}

/// `GET /config` from the server; local defaults when unreachable.
async fn fetch_runtime_config(server: &str) -> RuntimeConfig {
    let url = format!("{}/config", server.trim_end_matches('/'));
    match reqwest::get(&url).await {
        Ok(response) => match response.json::<RuntimeConfig>().await {
            Ok(config) => config,
            Err(e) => {
                warn!(event = "config_decode_failed", error = %e);
                RuntimeConfig::default()
            }
        },
        Err(e) => {
            warn!(event = "config_fetch_failed", %url, error = %e);
            RuntimeConfig::default()
        }
    }
}

/// Accept either a bare room id or a full `...?room=<id>` share link.
fn parse_room(input: &str) -> anyhow::Result<String> {
    let room = match input.split_once("room=") {
        Some((_, rest)) => rest.split('&').next().unwrap_or_default().to_string(),
        None => input.to_string(),
    };
    if !is_valid_room_id(&room) {
        anyhow::bail!("invalid room id: {room:?}");
    }
    Ok(room)
}

/// Terminal rendition of the Presenter port.
struct TerminalPresenter {
    auto_approve: bool,
    downloads: PathBuf,
    /// A progress line is being rewritten in place.
    mid_line: AtomicBool,
}

impl TerminalPresenter {
    fn new(auto_approve: bool, downloads: PathBuf) -> Self {
        Self {
            auto_approve,
            downloads,
            mid_line: AtomicBool::new(false),
        }
    }

    fn end_progress_line(&self) {
        if self.mid_line.swap(false, Ordering::Relaxed) {
            println!();
        }
    }
}

#[async_trait::async_trait]
impl Presenter for TerminalPresenter {
    fn status(&self, text: &str) {
        self.end_progress_line();
        println!("{text}");
    }

    fn progress(&self, report: &ProgressReport) {
        print!("\r{report}    ");
        let _ = std::io::stdout().flush();
        self.mid_line.store(true, Ordering::Relaxed);
    }

    fn warning(&self, text: &str) {
        self.end_progress_line();
        eprintln!("warning: {text}");
    }

    fn error(&self, text: &str) {
        self.end_progress_line();
        eprintln!("error: {text}");
    }

    async fn approve_join(&self, peer_id: &str, _room_id: &str) -> bool {
        self.end_progress_line();
        // Peer handles are 32 hex chars; the prompt only needs a prefix.
        let short: String = peer_id.chars().take(12).collect();
        if self.auto_approve {
            println!("Peer {short} joined (auto-approved).");
            return true;
        }
        print!("Peer {short} asks to join. Accept? [y/N] ");
        let _ = std::io::stdout().flush();
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).ok();
            line
        })
        .await
        .unwrap_or_default();
        matches!(answer.trim(), "y" | "Y" | "yes")
    }

    fn offer_download(&self, file: ReceivedFile) {
        self.end_progress_line();
        let dest = self.downloads.join(sanitize_file_name(&file.name));
        match std::fs::write(&dest, &file.bytes) {
            Ok(()) => println!("Saved {} ({} bytes)", dest.display(), file.bytes.len()),
            Err(e) => eprintln!("error: could not save {}: {e}", dest.display()),
        }
    }

    fn file_persisted(&self, name: &str, destination: &str) {
        self.end_progress_line();
        println!("Saved {name} to {destination}");
    }
}
