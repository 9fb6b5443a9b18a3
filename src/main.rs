use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info, warn};

use guild_jukebox::{
    audio::{GuildAudioSession, SessionRegistry, SongbirdDevice},
    bot::JukeboxBot,
    config::{Config, QueueBackend},
    sources::{ResourceResolver, YtDlpResolver},
    storage::{JsonQueueStore, MemoryQueueStore, QueueStore},
};

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Guild Jukebox v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let resolver = YtDlpResolver::new(config.ytdlp_path.clone(), config.resolve_timeout);

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        let version = resolver.verify().await?;
        println!("OK (yt-dlp {})", version);
        return Ok(());
    }

    match resolver.verify().await {
        Ok(version) => info!("✅ yt-dlp {} disponible", version),
        Err(e) => warn!("⚠️ yt-dlp no disponible, las canciones no podrán resolverse: {:?}", e),
    }

    // Inicializar almacenamiento de colas
    let json_store = match config.queue_backend {
        QueueBackend::Json => Some(Arc::new(JsonQueueStore::open(config.data_dir.clone()).await?)),
        QueueBackend::Memory => None,
    };
    let store: Arc<dyn QueueStore> = match &json_store {
        Some(store) => store.clone() as Arc<dyn QueueStore>,
        None => {
            info!("🧠 Colas en memoria, no se conservarán al reiniciar");
            Arc::new(MemoryQueueStore::new())
        }
    };

    let config = Arc::new(config);
    let resolver: Arc<dyn ResourceResolver> = Arc::new(resolver);
    let songbird = Songbird::serenity();
    let http = reqwest::Client::new();

    let registry = {
        let songbird = songbird.clone();
        let http = http.clone();
        let default_volume = config.default_volume;
        Arc::new(SessionRegistry::new(move |guild_id| {
            let device = SongbirdDevice::new(songbird.clone(), guild_id, http.clone());
            GuildAudioSession::new(
                guild_id,
                store.clone(),
                resolver.clone(),
                Arc::new(device),
                default_volume,
            )
        }))
    };

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = JukeboxBot::new(config.clone(), songbird.clone(), registry.clone(), http);

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    registry.close_all().await;
    if let Some(store) = json_store {
        store.close().await?;
    }

    info!("👋 Guild Jukebox detenido");
    Ok(())
}
