use anyhow::Result;
use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use songbird::Songbird;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A joined voice channel. Destroying it more than once is a no-op.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn is_destroyed(&self) -> bool;

    /// Leaves the channel. Returns `false` when it had already been destroyed.
    async fn destroy(&self) -> Result<bool>;
}

/// Voice connection managed by songbird.
pub struct SongbirdConnection {
    manager: Arc<Songbird>,
    guild_id: GuildId,
    channel_id: ChannelId,
    destroyed: AtomicBool,
}

impl SongbirdConnection {
    /// Joins `channel_id`, reusing the guild's call if one already exists.
    pub async fn join(manager: Arc<Songbird>, guild_id: GuildId, channel_id: ChannelId) -> Result<Self> {
        manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| anyhow::anyhow!("Error al unirse al canal: {:?}", e))?;

        info!("🔊 Conectado al canal {} en guild {}", channel_id, guild_id);

        Ok(Self {
            manager,
            guild_id,
            channel_id,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    async fn destroy(&self) -> Result<bool> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        // La llamada pudo haber sido eliminada ya por Discord; eso cuenta como desconexión
        if let Err(e) = self.manager.remove(self.guild_id).await {
            warn!("Llamada de guild {} ya no existía: {:?}", self.guild_id, e);
        }

        info!("👋 Desconectado del canal de voz en guild {}", self.guild_id);
        Ok(true)
    }
}
