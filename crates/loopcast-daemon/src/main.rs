mod core;
mod gateway;
mod mpv;
mod socket;

use loopcast_core::catalog::TrackCatalog;
use loopcast_core::config::Config;
use loopcast_core::platform;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    Log(String),
    /// Playback error surfaced to clients (state is re-sent alongside).
    Error(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only forward WARN and ERROR to clients to avoid clogging the channel
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();

        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

fn load_catalog(config: &Config) -> TrackCatalog {
    if config.catalog.tracks_json.exists() {
        match TrackCatalog::from_json_file(&config.catalog.tracks_json) {
            Ok(catalog) => {
                info!(
                    "Loaded {} tracks from {:?}",
                    catalog.len(),
                    config.catalog.tracks_json
                );
                return catalog;
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load {:?}: {} — using builtin catalog",
                    config.catalog.tracks_json,
                    e
                );
            }
        }
    }
    TrackCatalog::builtin(config.catalog.track_count)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so the logging layer can use it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("loopcastd.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let broadcast_layer = BroadcastLayer::new(broadcast_tx.clone());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(broadcast_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,loopcast_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let catalog = load_catalog(&config);

    // Event channel — all external inputs funnel into DaemonCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::DaemonEvent>(256);

    let daemon_core = core::DaemonCore::new(
        config.clone(),
        catalog.clone(),
        broadcast_tx.clone(),
        event_tx.clone(),
    )
    .await?;

    let state_manager = daemon_core.state_manager();

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        platform::DAEMON_TCP_PORT,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    // Audio gateway — mpv is directed here for track playback
    if config.http.enabled {
        let _gateway_handle = gateway::start_server(
            config.http.clone(),
            catalog,
            config.audio.upstream_base_url.clone(),
            config.audio.local_dir.clone(),
        );
    }

    info!("Daemon initialised, running event loop");
    daemon_core.run(event_rx).await?;

    Ok(())
}
