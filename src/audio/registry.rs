use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tracing::info;

use super::session::GuildAudioSession;

type SessionFactory = Box<dyn Fn(GuildId) -> GuildAudioSession + Send + Sync>;

/// One [`GuildAudioSession`] per guild, created on first lookup.
///
/// Creation goes through the map's entry lock, so concurrent first lookups for
/// the same guild all receive the same instance.
pub struct SessionRegistry {
    sessions: DashMap<GuildId, Arc<GuildAudioSession>>,
    factory: SessionFactory,
}

impl SessionRegistry {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(GuildId) -> GuildAudioSession + Send + Sync + 'static,
    {
        Self {
            sessions: DashMap::new(),
            factory: Box::new(factory),
        }
    }

    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<GuildAudioSession> {
        self.sessions
            .entry(guild_id)
            .or_insert_with(|| {
                info!("🆕 Sesión de audio creada para guild {}", guild_id);
                Arc::new((self.factory)(guild_id))
            })
            .clone()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<GuildAudioSession>> {
        self.sessions.get(&guild_id).map(|s| s.clone())
    }

    /// Removes the guild's session, stops its driver and tears down its
    /// connection. The guild's queue is kept in the store.
    pub async fn close(&self, guild_id: GuildId) -> bool {
        let Some((_, session)) = self.sessions.remove(&guild_id) else {
            return false;
        };
        session.shutdown().await;
        info!("🗑️ Sesión de audio cerrada para guild {}", guild_id);
        true
    }

    /// Closes every session, used on process shutdown.
    pub async fn close_all(&self) {
        let guilds: Vec<GuildId> = self.sessions.iter().map(|e| *e.key()).collect();
        for guild_id in guilds {
            self.close(guild_id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
