// Client vocal temps réel pour l'application de suivi des médicaments
//
// Cette application relie le micro, la session temps réel et le journal :
// - Parle au service avec /record, /stop
// - Écrit au service en tapant du texte
// - Affiche les transcriptions, l'état de la connexion et les alertes

mod settings;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use audio::{AudioCapture, CpalCapture, CpalSinkFactory, MemorySink, SinkFactory, SyntheticCapture};
use conversation::{ConversationState, JsonFileStore, ToolRegistry};
use network::{
    ConnectionState, ConnectionStatus, Connector, SessionEvent, SimulatedConnector, TransportSession,
    WsConnector, utils,
};

use settings::Settings;

#[derive(Parser)]
#[command(author, version, about = "Client vocal temps réel (suivi des médicaments)")]
struct Cli {
    /// Fichier de réglages TOML
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// URL du service (remplace celle des réglages)
    #[arg(long)]
    url: Option<String>,

    /// Micro synthétique et sortie muette, sans matériel audio
    #[arg(long)]
    synthetic: bool,

    /// Fréquence (Hz) du micro synthétique
    #[arg(long, default_value_t = 440.0)]
    tone: f32,

    /// Service simulé, sans réseau
    #[arg(long)]
    offline: bool,

    /// Logs détaillés
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(url) = cli.url {
        settings.url = url;
        settings.validate()?;
    }

    println!("🎙️  Client vocal - suivi des médicaments");
    println!("=========================================");

    let tools = ToolRegistry::new();
    let network_config = settings.network_config(tools.definitions());
    info!(config = ?network_config, synthetic = cli.synthetic, offline = cli.offline, "démarrage");

    let connector: Arc<dyn Connector> = if cli.offline {
        Arc::new(SimulatedConnector::new())
    } else {
        Arc::new(WsConnector::new(network_config.clone()))
    };

    let (capture, output): (Box<dyn AudioCapture>, Arc<dyn SinkFactory>) = if cli.synthetic {
        (
            Box::new(SyntheticCapture::new(settings.audio.clone()).with_tone(cli.tone, 0.3)),
            Arc::new(MemorySink::realtime()),
        )
    } else {
        (
            Box::new(CpalCapture::new(settings.audio.clone())),
            Arc::new(CpalSinkFactory::new(settings.audio.clone())),
        )
    };

    let (session, mut events) = TransportSession::new(network_config, connector)
        .with_audio_output(output, settings.audio.clone())
        .spawn();

    let store = match &settings.history_dir {
        Some(dir) => JsonFileStore::in_dir(dir),
        None => JsonFileStore::at_default_location(),
    };
    debug!(path = %store.path().display(), "historique");

    let (state, mut notices) = ConversationState::new(session.clone(), capture, Box::new(store));
    let mut state = state.with_tools(tools);

    print_help();
    if !state.messages().is_empty() {
        println!("📜 {} message(s) dans l'historique (/history)", state.messages().len());
    }

    session.connect()?;
    let mut status = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !run_command(&mut state, line.trim()).await {
                    break;
                }
            }
            Some(event) = events.recv() => {
                show_event(&event);
                state.handle_event(event).await;
            }
            Some(notice) = notices.recv() => println!("\n⚠️  {}", notice.message()),
            Ok(()) = status.changed() => {
                let current = status.borrow_and_update().clone();
                show_status(&current);
            }
            _ = signal::ctrl_c() => {
                println!("\n🛑 Interruption");
                break;
            }
        }
    }

    if state.is_recording() {
        state.stop_recording().await?;
    }
    session.disconnect().await?;
    session.shutdown();

    println!("👋 Au revoir !");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn print_help() {
    println!("\n📋 Commandes :");
    println!("   /record      - Parler au service");
    println!("   /stop        - Arrêter le micro");
    println!("   /history     - Afficher l'historique");
    println!("   /clear       - Effacer l'historique");
    println!("   /status      - État de la connexion");
    println!("   /connect     - Se (re)connecter");
    println!("   /disconnect  - Se déconnecter");
    println!("   /quit        - Quitter");
    println!("   (autre texte : envoyé comme message)");
}

/// Exécute une ligne saisie, retourne `false` pour quitter
async fn run_command(state: &mut ConversationState, line: &str) -> bool {
    match line {
        "" => {}
        "/quit" | "/q" => return false,
        "/help" => print_help(),
        "/record" => match state.start_recording().await {
            Ok(()) => {
                println!("🔴 Enregistrement... (/stop pour arrêter)");
                if let Some(mut level) = state.level() {
                    tokio::spawn(async move {
                        while level.changed().await.is_ok() {
                            let value = *level.borrow_and_update();
                            debug!(level = value, "niveau micro");
                        }
                    });
                }
            }
            Err(e) => println!("❌ {}", e),
        },
        "/stop" => match state.stop_recording().await {
            Ok(()) => println!("⏹️  Micro arrêté"),
            Err(e) => println!("❌ {}", e),
        },
        "/history" => {
            if state.messages().is_empty() {
                println!("📭 Historique vide");
            }
            for message in state.messages() {
                let marker = if message.is_audio { "🔊" } else { "💬" };
                println!(
                    "{} [{}] {} : {}",
                    marker,
                    message.timestamp.format("%d/%m %H:%M"),
                    message.role(),
                    message.content
                );
            }
        }
        "/clear" => {
            state.clear_history();
            println!("🗑️  Historique effacé");
        }
        "/status" => {
            let current = state.session().state();
            show_status(&current);
            println!("   Latences : {}", utils::format_latency(&current.latency_samples));
            if let Some(stats) = state.session().playback_stats().await {
                println!(
                    "   Lecture : {} joués, {} perdus ({:.1}%)",
                    stats.fragments_played,
                    stats.fragments_dropped,
                    stats.drop_percentage()
                );
            }
        }
        "/connect" => {
            if let Err(e) = state.session().connect() {
                println!("❌ {}", e);
            }
        }
        "/disconnect" => {
            if let Err(e) = state.session().disconnect().await {
                println!("❌ {}", e);
            }
        }
        text if text.starts_with('/') => println!("❌ Commande inconnue : {}", text),
        text => {
            if let Err(e) = state.send_text(text).await {
                println!("❌ {}", e);
            }
        }
    }
    true
}

fn show_event(event: &SessionEvent) {
    match event {
        SessionEvent::TranscriptDelta(delta) => {
            print!("{}", delta);
            let _ = std::io::stdout().flush();
        }
        SessionEvent::TranscriptDone { .. } => println!(),
        SessionEvent::UserTranscript(text) => println!("🗣️  {}", text),
        SessionEvent::FunctionCall { name, .. } => println!("🔧 Outil demandé : {}", name),
        SessionEvent::ResponseDone | SessionEvent::Notice(_) => {}
    }
}

fn show_status(state: &ConnectionState) {
    let icon = match state.status {
        ConnectionStatus::Open => "🟢",
        ConnectionStatus::Connecting { .. } => "🟡",
        ConnectionStatus::Failed => "🔴",
        ConnectionStatus::Disconnected | ConnectionStatus::Closed(_) => "⚪",
    };
    println!(
        "{} {} (qualité : {} {})",
        icon,
        state.status.description(),
        state.quality.indicator(),
        state.quality.description()
    );
}
