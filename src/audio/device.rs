use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use songbird::{
    input::{HttpRequest, Input},
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::events::{DeviceEvent, DeviceEvents, DeviceState};
use crate::sources::PlayableResource;

/// The actuator a session drives. Only the owning session calls it.
///
/// Implementations report their own transitions through the [`DeviceEvents`]
/// handed to [`attach`](Self::attach), including `Playing -> Idle` when a
/// track ends and [`DeviceEvent::Error`] when a stream breaks mid-playback.
#[async_trait]
pub trait PlaybackDevice: Send + Sync {
    fn attach(&self, events: DeviceEvents);

    /// Starts `resource` at `volume` (fraction), replacing whatever was loaded.
    async fn play(&self, resource: &PlayableResource, volume: f32) -> Result<()>;

    /// `false` when there was nothing playing to pause.
    fn pause(&self) -> bool;

    /// `false` when there was nothing paused to resume.
    fn unpause(&self) -> bool;

    /// Stops the loaded track without reporting a transition.
    fn stop(&self);

    fn set_volume(&self, volume: f32);

    fn state(&self) -> DeviceState;
}

struct Playback {
    current: Option<TrackHandle>,
    state: DeviceState,
}

struct DeviceInner {
    manager: Arc<Songbird>,
    guild_id: GuildId,
    http: reqwest::Client,
    events: Mutex<Option<DeviceEvents>>,
    playback: Mutex<Playback>,
}

impl DeviceInner {
    fn emit(&self, event: DeviceEvent) {
        let events = self.events.lock().clone();
        match events {
            Some(events) => {
                events.emit(event);
            }
            None => debug!("Dispositivo sin sesión, evento descartado: {:?}", event),
        }
    }

    /// Applies the volume and registers the end/error notifiers.
    fn prepare_track(self: &Arc<Self>, handle: &TrackHandle, volume: f32) -> Result<()> {
        handle
            .set_volume(volume)
            .map_err(|e| anyhow::anyhow!("Error al ajustar volumen: {:?}", e))?;

        for (event, errored) in [(TrackEvent::End, false), (TrackEvent::Error, true)] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackNotifier {
                        device: Arc::downgrade(self),
                        handle: handle.clone(),
                        errored,
                    },
                )
                .map_err(|e| anyhow::anyhow!("Error al agregar event handler: {:?}", e))?;
        }
        Ok(())
    }

    /// Called from songbird when `handle` ends or errors. Tracks that are no
    /// longer current are ignored.
    fn track_finished(&self, handle: &TrackHandle, error: Option<String>) {
        {
            let mut playback = self.playback.lock();
            let is_current = playback
                .current
                .as_ref()
                .is_some_and(|current| current.uuid() == handle.uuid());
            if !is_current {
                return;
            }
            playback.current = None;
            playback.state = DeviceState::Idle;
        }

        match error {
            Some(reason) => {
                warn!("❌ Error de stream en guild {}: {}", self.guild_id, reason);
                self.emit(DeviceEvent::Error(reason));
            }
            // A track that ends while paused still counts as finished
            None => self.emit(DeviceEvent::finished()),
        }
    }
}

/// Runs `setup` on a track that is already playing, calling `stop` on it when
/// setup fails.
fn setup_or_stop<H>(
    handle: &H,
    setup: impl FnOnce(&H) -> Result<()>,
    stop: impl FnOnce(&H),
) -> Result<()> {
    setup(handle).inspect_err(|e| {
        warn!("Preparación del track falló, deteniéndolo: {:?}", e);
        stop(handle);
    })
}

/// Plays on the guild's songbird call.
pub struct SongbirdDevice {
    inner: Arc<DeviceInner>,
}

impl SongbirdDevice {
    pub fn new(manager: Arc<Songbird>, guild_id: GuildId, http: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                manager,
                guild_id,
                http,
                events: Mutex::new(None),
                playback: Mutex::new(Playback {
                    current: None,
                    state: DeviceState::Idle,
                }),
            }),
        }
    }

    fn transition(&self, from: DeviceState, to: DeviceState, action: impl FnOnce(&TrackHandle) -> bool) -> bool {
        {
            let mut playback = self.inner.playback.lock();
            if playback.state != from {
                return false;
            }
            let Some(handle) = playback.current.as_ref() else {
                return false;
            };
            if !action(handle) {
                return false;
            }
            playback.state = to;
        }
        self.inner.emit(DeviceEvent::StateChange { old: from, new: to });
        true
    }
}

#[async_trait]
impl PlaybackDevice for SongbirdDevice {
    fn attach(&self, events: DeviceEvents) {
        *self.inner.events.lock() = Some(events);
    }

    async fn play(&self, resource: &PlayableResource, volume: f32) -> Result<()> {
        let call = self
            .inner
            .manager
            .get(self.inner.guild_id)
            .ok_or_else(|| anyhow::anyhow!("Sin conexión de voz en guild {}", self.inner.guild_id))?;

        let input: Input = HttpRequest::new(self.inner.http.clone(), resource.stream_url.clone()).into();

        let handle = {
            let mut call = call.lock().await;
            call.play_only_input(input)
        };
        let old = {
            let mut playback = self.inner.playback.lock();
            playback.current = Some(handle.clone());
            std::mem::replace(&mut playback.state, DeviceState::Playing)
        };

        // The track is already running; a failed setup must not leave it orphaned
        setup_or_stop(
            &handle,
            |handle| self.inner.prepare_track(handle, volume),
            |_| self.stop(),
        )?;

        info!("🎵 Reproduciendo en guild {}: {}", self.inner.guild_id, resource.display_name());
        self.inner.emit(DeviceEvent::StateChange {
            old,
            new: DeviceState::Playing,
        });
        Ok(())
    }

    fn pause(&self) -> bool {
        self.transition(DeviceState::Playing, DeviceState::Paused, |handle| {
            handle.pause().is_ok()
        })
    }

    fn unpause(&self) -> bool {
        self.transition(DeviceState::Paused, DeviceState::Playing, |handle| {
            handle.play().is_ok()
        })
    }

    fn stop(&self) {
        let handle = {
            let mut playback = self.inner.playback.lock();
            playback.state = DeviceState::Idle;
            playback.current.take()
        };
        if let Some(handle) = handle {
            let _ = handle.stop();
            debug!("⏹️ Track detenido en guild {}", self.inner.guild_id);
        }
    }

    fn set_volume(&self, volume: f32) {
        if let Some(handle) = self.inner.playback.lock().current.as_ref() {
            let _ = handle.set_volume(volume);
        }
    }

    fn state(&self) -> DeviceState {
        self.inner.playback.lock().state
    }
}

/// Songbird handler for the end or error of one specific track.
struct TrackNotifier {
    device: Weak<DeviceInner>,
    handle: TrackHandle,
    errored: bool,
}

#[async_trait]
impl VoiceEventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let device = self.device.upgrade()?;

        let error = self.errored.then(|| {
            if let EventContext::Track(tracks) = ctx {
                tracks
                    .iter()
                    .find_map(|(state, _)| match &state.playing {
                        PlayMode::Errored(e) => Some(format!("{:?}", e)),
                        _ => None,
                    })
                    .unwrap_or_else(|| "error de reproducción".to_string())
            } else {
                "error de reproducción".to_string()
            }
        });

        device.track_finished(&self.handle, error);
        None
    }
}
