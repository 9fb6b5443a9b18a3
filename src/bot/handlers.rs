use anyhow::Result;
use serenity::{
    builder::{CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::{CommandDataOption, CommandInteraction},
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    audio::{GuildAudioSession, SongbirdConnection},
    bot::JukeboxBot,
    playlist::{fetch_all, PageRequest},
    sources::{parse_playlist_id, parse_video_id, youtube_api_v3::MAX_PAGE_SIZE, YouTubePlaylistItems},
};

/// Items shown by `/queue` before collapsing the rest into a count.
const QUEUE_PREVIEW: usize = 10;

/// Handles a slash command.
///
/// Every command is deferred first; the reply replaces the "thinking" state
/// once the session has done its work. Failures become an error reply.
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &JukeboxBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    // Defer la respuesta ya que puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let session = bot.registry.get_or_create(guild_id);
    let reply = match run_command(ctx, &command, bot, guild_id, &session).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Comando /{} falló en guild {}: {}", command.data.name, guild_id, e);
            format!("❌ {}", e)
        }
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(reply))
        .await?;

    Ok(())
}

async fn run_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
    session: &Arc<GuildAudioSession>,
) -> Result<String> {
    let options = &command.data.options;

    let reply = match command.data.name.as_str() {
        "play" => {
            let query = string_option(options, "query")
                .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?;
            let video_id = parse_video_id(query)?;

            ensure_connected(ctx, bot, guild_id, command.user.id, session).await?;
            let position = session.enqueue(&video_id).await?;
            session.ensure_playing();

            format!("🎵 Agregado a la cola: `{}` (posición {})", video_id, position)
        }
        "playlist" => {
            let url = string_option(options, "url")
                .ok_or_else(|| anyhow::anyhow!("URL no proporcionada"))?;
            let api_key = bot
                .config
                .youtube_api_key
                .clone()
                .ok_or_else(|| anyhow::anyhow!("Importar playlists requiere YOUTUBE_API_KEY"))?;
            let playlist_id = parse_playlist_id(url)?;

            ensure_connected(ctx, bot, guild_id, command.user.id, session).await?;

            let api = YouTubePlaylistItems::new(bot.http.clone(), api_key, playlist_id.clone());
            let ids = fetch_all(&api, PageRequest::first(MAX_PAGE_SIZE), bot.config.max_playlist_size).await;
            if ids.is_empty() {
                anyhow::bail!("No se encontraron videos en la playlist {}", playlist_id);
            }

            let added = session.import(ids).await;
            session.ensure_playing();

            format!("📋 Agregadas {} canciones de la playlist", added)
        }
        "pause" => control_reply(session.pause(), "⏸️ Reproducción pausada", "No hay nada que pausar"),
        "resume" => control_reply(session.unpause(), "▶️ Reproducción reanudada", "No hay nada que reanudar"),
        "skip" => control_reply(session.skip(), "⏭️ Canción saltada", "No hay nada que saltar"),
        "loop" => {
            let enabled = bool_option(options, "enabled").unwrap_or(!session.is_looping());
            session.set_loop(enabled);
            if enabled {
                "🔁 Repetir cola activado".to_string()
            } else {
                "➡️ Repetición desactivada".to_string()
            }
        }
        "volume" => {
            let level = int_option(options, "level")
                .ok_or_else(|| anyhow::anyhow!("Volumen no proporcionado"))?;
            let percent = i32::try_from(level).unwrap_or(-1);
            control_reply(
                session.set_volume(percent),
                &format!("🔊 Volumen ajustado a {}%", percent),
                "El volumen debe estar entre 0 y 100",
            )
        }
        "queue" => {
            let items = session.queued_items().await;
            format_queue(&items, session.current_item().as_deref(), QUEUE_PREVIEW)
        }
        "leave" => control_reply(
            session.destroy_connection().await,
            "👋 Desconectado del canal de voz",
            "No estoy en un canal de voz",
        ),
        _ => "❌ Comando no reconocido".to_string(),
    };

    Ok(reply)
}

/// Joins the caller's voice channel unless the session already holds a live connection.
async fn ensure_connected(
    ctx: &Context,
    bot: &JukeboxBot,
    guild_id: GuildId,
    user_id: UserId,
    session: &GuildAudioSession,
) -> Result<()> {
    if session.busy() {
        return Ok(());
    }

    let channel_id = get_user_voice_channel(ctx, guild_id, user_id)?;
    let connection = SongbirdConnection::join(bot.songbird.clone(), guild_id, channel_id).await?;
    session.attach_connection(Arc::new(connection));

    Ok(())
}

// Funciones auxiliares

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<ChannelId> {
    let guild = guild_id
        .to_guild_cached(&ctx.cache)
        .ok_or_else(|| anyhow::anyhow!("Guild no encontrada en caché"))?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or_else(|| anyhow::anyhow!("Debes estar en un canal de voz"))?;

    Ok(channel_id)
}

fn find_option<'a>(options: &'a [CommandDataOption], name: &str) -> Option<&'a CommandDataOption> {
    options.iter().find(|opt| opt.name == name)
}

fn string_option<'a>(options: &'a [CommandDataOption], name: &str) -> Option<&'a str> {
    find_option(options, name).and_then(|opt| opt.value.as_str())
}

fn int_option(options: &[CommandDataOption], name: &str) -> Option<i64> {
    find_option(options, name).and_then(|opt| opt.value.as_i64())
}

fn bool_option(options: &[CommandDataOption], name: &str) -> Option<bool> {
    find_option(options, name).and_then(|opt| opt.value.as_bool())
}

fn control_reply(applied: bool, done: &str, nothing: &str) -> String {
    if applied {
        done.to_string()
    } else {
        format!("ℹ️ {}", nothing)
    }
}

/// Renders the queue head-first. The head is the item being played when
/// `current` matches it.
fn format_queue(items: &[String], current: Option<&str>, limit: usize) -> String {
    if items.is_empty() {
        return "📭 La cola está vacía".to_string();
    }

    let mut lines = vec![format!("📋 **Cola** ({} canciones)", items.len())];
    for (index, item) in items.iter().take(limit).enumerate() {
        let marker = if index == 0 && current == Some(item.as_str()) {
            "▶️"
        } else {
            "▫️"
        };
        lines.push(format!("{} {}. `{}`", marker, index + 1, item));
    }

    if items.len() > limit {
        lines.push(format!("... y {} más", items.len() - limit));
    }

    lines.join("\n")
}
