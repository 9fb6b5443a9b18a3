//! # Bot Module
//!
//! Discord front-end for the guild jukebox.
//!
//! The bot is a thin trigger around [`SessionRegistry`]: slash commands look
//! up (or create) the guild's [`GuildAudioSession`](crate::audio::GuildAudioSession)
//! and call into it. Nothing here touches the queue or the voice driver
//! directly.
//!
//! ## Events
//!
//! - `ready`: registers the slash commands (per guild when `GUILD_ID` is set)
//! - `interaction_create`: dispatches commands to [`handlers`]
//! - `voice_state_update`: tears down the session's connection when the bot
//!   is disconnected from voice

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use songbird::Songbird;
use std::sync::Arc;
use tracing::{error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{audio::SessionRegistry, config::Config};

/// Serenity event handler for the jukebox.
pub struct JukeboxBot {
    config: Arc<Config>,
    /// Voice manager shared with the playback devices
    songbird: Arc<Songbird>,
    registry: Arc<SessionRegistry>,
    /// HTTP client for the YouTube API
    http: reqwest::Client,
}

impl JukeboxBot {
    pub fn new(
        config: Arc<Config>,
        songbird: Arc<Songbird>,
        registry: Arc<SessionRegistry>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            songbird,
            registry,
            http,
        }
    }

    /// Registers slash commands globally, or on `GUILD_ID` for faster
    /// propagation during development.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);

                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    error!("❌ Error registrando comandos de guild: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica que el bot tenga permisos de 'applications.commands' en la guild.")
                })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Drops the session's connection when the bot itself leaves voice, either
    /// kicked by a moderator or disconnected by Discord. The queue is kept.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }

        let Some(guild_id) = new.guild_id else {
            return;
        };

        info!("🔌 Bot desconectado en guild {}", guild_id);
        if let Some(session) = self.registry.get(guild_id) {
            session.destroy_connection().await;
        }
    }
}
