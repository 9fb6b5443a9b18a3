use futures::FutureExt;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::connection::VoiceConnection;
use super::device::PlaybackDevice;
use super::events::{DeviceEvent, DeviceEvents};
use crate::error::{JukeboxError, JukeboxResult};
use crate::sources::{PlayableResource, ResourceResolver};
use crate::storage::{QueueKey, QueueStore};

/// Result of one playback cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The head finished, was skipped, or failed; the queue moved forward.
    Advanced,
    /// Nothing was queued when the cycle started.
    Empty,
    /// The connection was torn down while the head was being resolved. The
    /// resolved resource was discarded and the head is still queued.
    Detached,
}

/// How the play phase of a cycle ended.
enum HeadEnd {
    Consumed,
    Detached,
}

/// Playback state for one guild.
///
/// Owns the guild's queue handle, its playback device, an optional voice
/// connection, the volume and the loop flag. [`run_cycle`](Self::run_cycle)
/// plays exactly one queue head; [`ensure_playing`](Self::ensure_playing)
/// keeps calling it until the queue runs dry.
///
/// Every control is safe to call while a cycle is in flight.
pub struct GuildAudioSession {
    guild_id: GuildId,
    queue_key: QueueKey,
    store: Arc<dyn QueueStore>,
    resolver: Arc<dyn ResourceResolver>,
    device: Arc<dyn PlaybackDevice>,
    events: DeviceEvents,
    connection: Mutex<Option<Arc<dyn VoiceConnection>>>,
    current: Mutex<Option<PlayableResource>>,
    volume: Mutex<f32>,
    looping: AtomicBool,
    /// Bumped on every connection teardown.
    epoch: AtomicU64,
    cycle_lock: tokio::sync::Mutex<()>,
    driving: AtomicBool,
    /// Set by `ensure_playing` calls that found a driver already running.
    retrigger: AtomicBool,
}

impl GuildAudioSession {
    pub fn new(
        guild_id: GuildId,
        store: Arc<dyn QueueStore>,
        resolver: Arc<dyn ResourceResolver>,
        device: Arc<dyn PlaybackDevice>,
        default_volume: f32,
    ) -> Self {
        let events = DeviceEvents::new();
        device.attach(events.clone());

        Self {
            guild_id,
            queue_key: QueueKey::music(guild_id),
            store,
            resolver,
            device,
            events,
            connection: Mutex::new(None),
            current: Mutex::new(None),
            volume: Mutex::new(default_volume.clamp(0.0, 1.0)),
            looping: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            cycle_lock: tokio::sync::Mutex::new(()),
            driving: AtomicBool::new(false),
            retrigger: AtomicBool::new(false),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Plays the queue head once.
    ///
    /// Never fails: resolution errors, stream errors, store errors on pop and
    /// panics all count as "item consumed" and resolve to
    /// [`CycleOutcome::Advanced`]. Cycles of the same session never overlap.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let _cycle = self.cycle_lock.lock().await;

        let head = match self.store.peek_first(&self.queue_key).await {
            Ok(Some(head)) => head,
            Ok(None) => {
                debug!("📭 Cola vacía en guild {}", self.guild_id);
                return CycleOutcome::Empty;
            }
            Err(e) => {
                error!("Error leyendo la cola de guild {}: {:?}", self.guild_id, e);
                return CycleOutcome::Empty;
            }
        };

        let result = AssertUnwindSafe(self.play_head(&head)).catch_unwind().await;
        self.current.lock().take();

        match result {
            Ok(Ok(HeadEnd::Consumed)) => {
                debug!("✅ Terminó {} en guild {}", head, self.guild_id);
            }
            Ok(Ok(HeadEnd::Detached)) => {
                info!("🔌 Conexión cerrada durante la resolución de {}, se conserva en cola", head);
                return CycleOutcome::Detached;
            }
            Ok(Err(e)) => {
                warn!("⏭️ Saltando {} en guild {}: {}", head, self.guild_id, e);
            }
            Err(_) => {
                error!("💥 Pánico reproduciendo {} en guild {}, saltando", head, self.guild_id);
            }
        }

        self.consume_head(&head).await;
        CycleOutcome::Advanced
    }

    async fn play_head(&self, head: &str) -> JukeboxResult<HeadEnd> {
        let epoch = self.epoch.load(Ordering::SeqCst);

        // Armed before resolving: a finish that lands during resolution is kept
        let mut finished = self.events.watch(DeviceEvent::is_finish);

        let resource = self.resolver.resolve(head).await?;
        if resource.stream_url.trim().is_empty() {
            return Err(JukeboxError::resolution(head, "recurso vacío"));
        }

        if finished.try_fired().is_some() {
            debug!("Fin recibido durante la resolución de {}", head);
            return Ok(HeadEnd::Consumed);
        }
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Ok(HeadEnd::Detached);
        }

        let mut failed = self.events.watch(DeviceEvent::is_error);
        let volume = self.volume();
        *self.current.lock() = Some(resource.clone());

        self.device
            .play(&resource, volume)
            .await
            .map_err(|e| JukeboxError::Stream(e.to_string()))?;

        info!(
            "🎵 Reproduciendo {} en guild {} ({}%)",
            resource.display_name(),
            self.guild_id,
            (volume * 100.0).round() as u32
        );

        tokio::select! {
            Some(_) = finished.fired() => Ok(HeadEnd::Consumed),
            Some(event) = failed.fired() => match event {
                DeviceEvent::Error(reason) => Err(JukeboxError::Stream(reason)),
                _ => Ok(HeadEnd::Consumed),
            },
            else => Ok(HeadEnd::Consumed),
        }
    }

    /// Pops the head; with looping on it goes back to the tail.
    async fn consume_head(&self, head: &str) {
        match self.store.pop_first(&self.queue_key).await {
            Ok(Some(popped)) => {
                if popped != head {
                    warn!("La cabeza cambió durante el ciclo: esperaba {}, se quitó {}", head, popped);
                }
                if self.is_looping() {
                    if let Err(e) = self.store.push(&self.queue_key, &popped).await {
                        error!("Error re-encolando {} en guild {}: {:?}", popped, self.guild_id, e);
                    } else {
                        debug!("🔁 {} vuelve al final de la cola", popped);
                    }
                }
            }
            Ok(None) => warn!("La cola de guild {} ya estaba vacía al avanzar", self.guild_id),
            Err(e) => error!("Error quitando {} de la cola de guild {}: {:?}", head, self.guild_id, e),
        }
    }

    /// Starts a background driver that plays the queue until it is empty.
    ///
    /// Returns `false` when a driver is already running; that driver then
    /// re-checks the queue before exiting, so the request is not lost. The
    /// driver stops when the queue runs dry or the connection is torn down.
    pub fn ensure_playing(self: &Arc<Self>) -> bool {
        self.retrigger.store(true, Ordering::SeqCst);
        if self.driving.swap(true, Ordering::SeqCst) {
            return false;
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.drive().await;
        });
        true
    }

    async fn drive(&self) {
        info!("▶️ Reproducción iniciada en guild {}", self.guild_id);

        loop {
            self.retrigger.store(false, Ordering::SeqCst);
            let epoch = self.epoch.load(Ordering::SeqCst);

            let mut outcome = CycleOutcome::Advanced;
            while outcome == CycleOutcome::Advanced && self.epoch.load(Ordering::SeqCst) == epoch {
                outcome = self.run_cycle().await;
            }

            self.driving.store(false, Ordering::SeqCst);

            // A teardown clears `retrigger`, so it is only set here by a request
            // made after the last teardown, or one racing the final empty cycle
            let requested = self.retrigger.load(Ordering::SeqCst)
                || (outcome == CycleOutcome::Empty && self.epoch.load(Ordering::SeqCst) == epoch);
            let restart = requested
                && self.queue_len().await > 0
                && !self.driving.swap(true, Ordering::SeqCst);
            if !restart {
                break;
            }
            debug!("🔄 Reanudando el driver de guild {}", self.guild_id);
        }

        info!("⏹️ Reproducción detenida en guild {}", self.guild_id);
    }

    /// Appends an item and returns the new queue length.
    pub async fn enqueue(&self, item_id: &str) -> JukeboxResult<usize> {
        self.store.push(&self.queue_key, item_id).await?;
        let len = self.store.len(&self.queue_key).await?;
        info!("➕ Agregado a la cola de guild {}: {} ({} en cola)", self.guild_id, item_id, len);
        Ok(len)
    }

    /// Appends every id in order; stops at the first store failure.
    pub async fn import<I>(&self, item_ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut added = 0;
        for item_id in item_ids {
            if let Err(e) = self.store.push(&self.queue_key, &item_id).await {
                error!("Error importando {} en guild {}: {:?}", item_id, self.guild_id, e);
                break;
            }
            added += 1;
        }
        info!("➕ Agregadas {} canciones a la cola de guild {}", added, self.guild_id);
        added
    }

    pub fn pause(&self) -> bool {
        let paused = self.device.pause();
        if paused {
            info!("⏸️ Reproducción pausada en guild {}", self.guild_id);
        }
        paused
    }

    pub fn unpause(&self) -> bool {
        let resumed = self.device.unpause();
        if resumed {
            info!("▶️ Reproducción reanudada en guild {}", self.guild_id);
        }
        resumed
    }

    /// Ends the loaded track early by reporting the same `Playing -> Idle`
    /// transition a natural finish would.
    pub fn skip(&self) -> bool {
        let Some(item_id) = self.current_item() else {
            return false;
        };

        self.device.stop();
        self.events.emit(DeviceEvent::finished());
        info!("⏭️ Saltando {} en guild {}", item_id, self.guild_id);
        true
    }

    /// `percent` must be within 0..=100. Applied live to the loaded track.
    pub fn set_volume(&self, percent: i32) -> bool {
        if !(0..=100).contains(&percent) {
            return false;
        }

        let fraction = percent as f32 / 100.0;
        *self.volume.lock() = fraction;
        if self.current.lock().is_some() {
            self.device.set_volume(fraction);
        }
        info!("🔊 Volumen de guild {} ajustado a {}%", self.guild_id, percent);
        true
    }

    /// Takes effect the next time a head is consumed.
    pub fn set_loop(&self, enabled: bool) {
        self.looping.store(enabled, Ordering::SeqCst);
        if enabled {
            info!("🔁 Repetir cola activado en guild {}", self.guild_id);
        } else {
            info!("➡️ Repetición desactivada en guild {}", self.guild_id);
        }
    }

    pub fn attach_connection(&self, connection: Arc<dyn VoiceConnection>) {
        *self.connection.lock() = Some(connection);
    }

    /// Leaves the voice channel. Returns `false` if there was nothing to tear down.
    pub async fn destroy_connection(&self) -> bool {
        let connection = self.connection.lock().take();
        let Some(connection) = connection else {
            return false;
        };
        if connection.is_destroyed() {
            return false;
        }

        self.halt();
        Self::release(self.guild_id, connection).await
    }

    /// Stops the driver and leaves voice, whether or not a connection exists.
    /// The queue itself is kept.
    pub async fn shutdown(&self) {
        self.halt();
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            Self::release(self.guild_id, connection).await;
        }
    }

    /// Invalidates the running driver and ends the loaded track.
    fn halt(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.retrigger.store(false, Ordering::SeqCst);
        let was_loaded = self.current.lock().take().is_some();
        self.device.stop();
        if was_loaded {
            self.events.emit(DeviceEvent::finished());
        }
    }

    async fn release(guild_id: GuildId, connection: Arc<dyn VoiceConnection>) -> bool {
        match connection.destroy().await {
            Ok(destroyed) => destroyed,
            Err(e) => {
                warn!("Error al desconectar guild {}: {:?}", guild_id, e);
                true
            }
        }
    }

    /// A live voice connection exists.
    pub fn busy(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|connection| !connection.is_destroyed())
    }

    /// A driver task is currently playing the queue.
    pub fn is_driving(&self) -> bool {
        self.driving.load(Ordering::SeqCst)
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    pub fn volume_percent(&self) -> u8 {
        (self.volume() * 100.0).round() as u8
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::SeqCst)
    }

    /// Id of the item currently loaded into the device.
    pub fn current_item(&self) -> Option<String> {
        self.current.lock().as_ref().map(|r| r.item_id.clone())
    }

    pub async fn queue_len(&self) -> usize {
        self.store.len(&self.queue_key).await.unwrap_or_else(|e| {
            warn!("Error leyendo la cola de guild {}: {:?}", self.guild_id, e);
            0
        })
    }

    pub async fn queued_items(&self) -> Vec<String> {
        self.store.items(&self.queue_key).await.unwrap_or_else(|e| {
            warn!("Error leyendo la cola de guild {}: {:?}", self.guild_id, e);
            Vec::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{
        gated_resolver, ok_resolver, FakeConnection, GatedStore, RecordingDevice,
    };
    use crate::sources::MockResourceResolver;
    use crate::storage::{JsonQueueStore, MemoryQueueStore};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    async fn session_with(
        items: &[&str],
        resolver: impl ResourceResolver + 'static,
        device: Arc<RecordingDevice>,
    ) -> Arc<GuildAudioSession> {
        session_on(Arc::new(MemoryQueueStore::new()), items, resolver, device).await
    }

    async fn session_on(
        store: Arc<dyn QueueStore>,
        items: &[&str],
        resolver: impl ResourceResolver + 'static,
        device: Arc<RecordingDevice>,
    ) -> Arc<GuildAudioSession> {
        let session = Arc::new(GuildAudioSession::new(
            GuildId::new(7),
            store,
            Arc::new(resolver),
            device,
            0.5,
        ));
        for item in items {
            session.enqueue(item).await.unwrap();
        }
        session
    }

    #[tokio::test]
    async fn resolvable_item_plays_and_is_popped() {
        let device = Arc::new(RecordingDevice::auto_finishing());
        let session = session_with(&["a"], ok_resolver(), device.clone()).await;

        assert_eq!(session.run_cycle().await, CycleOutcome::Advanced);
        assert_eq!(session.queue_len().await, 0);
        assert_eq!(session.current_item(), None);
        assert_eq!(device.played(), vec!["a"]);
        assert_eq!(device.volumes(), vec![0.5]);
    }

    #[tokio::test]
    async fn empty_queue_touches_nothing() {
        let mut resolver = MockResourceResolver::new();
        resolver.expect_resolve().times(0);
        let device = Arc::new(RecordingDevice::auto_finishing());
        let session = session_with(&[], resolver, device.clone()).await;

        assert_eq!(session.run_cycle().await, CycleOutcome::Empty);
        assert!(device.played().is_empty());
    }

    #[tokio::test]
    async fn resolver_failure_pops_without_playing() {
        let mut resolver = MockResourceResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|id| Err(JukeboxError::resolution(id, "video no disponible")));
        let device = Arc::new(RecordingDevice::auto_finishing());
        let session = session_with(&["broken", "next"], resolver, device.clone()).await;

        assert_eq!(session.run_cycle().await, CycleOutcome::Advanced);
        assert!(device.played().is_empty());
        assert_eq!(session.queued_items().await, vec!["next"]);
    }

    #[tokio::test]
    async fn empty_stream_url_counts_as_resolution_failure() {
        let mut resolver = MockResourceResolver::new();
        resolver
            .expect_resolve()
            .returning(|id| Ok(PlayableResource::new(id, "  ")));
        let device = Arc::new(RecordingDevice::auto_finishing());
        let session = session_with(&["a"], resolver, device.clone()).await;

        assert_eq!(session.run_cycle().await, CycleOutcome::Advanced);
        assert!(device.played().is_empty());
        assert_eq!(session.queue_len().await, 0);
    }

    #[tokio::test]
    async fn loop_requeues_head_at_tail() {
        let device = Arc::new(RecordingDevice::auto_finishing());
        let session = session_with(&["a", "b"], ok_resolver(), device).await;
        session.set_loop(true);

        assert_eq!(session.run_cycle().await, CycleOutcome::Advanced);
        assert_eq!(session.queued_items().await, vec!["b", "a"]);

        session.set_loop(false);
        assert_eq!(session.run_cycle().await, CycleOutcome::Advanced);
        assert_eq!(session.queued_items().await, vec!["a"]);
    }

    #[tokio::test]
    async fn failed_items_are_requeued_when_looping() {
        let mut resolver = MockResourceResolver::new();
        resolver
            .expect_resolve()
            .returning(|id| Err(JukeboxError::resolution(id, "403")));
        let device = Arc::new(RecordingDevice::auto_finishing());
        let session = session_with(&["a", "b"], resolver, device).await;
        session.set_loop(true);

        assert_eq!(session.run_cycle().await, CycleOutcome::Advanced);
        assert_eq!(session.queued_items().await, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn volume_bounds() {
        let device = Arc::new(RecordingDevice::auto_finishing());
        let session = session_with(&[], ok_resolver(), device).await;

        assert!(!session.set_volume(-1));
        assert!(!session.set_volume(101));
        assert_eq!(session.volume_percent(), 50);

        assert!(session.set_volume(50));
        assert_eq!(session.volume_percent(), 50);
        assert!(session.set_volume(0));
        assert_eq!(session.volume(), 0.0);
        assert!(session.set_volume(100));
        assert_eq!(session.volume(), 1.0);
    }

    #[tokio::test]
    async fn skip_with_nothing_loaded_is_false() {
        let device = Arc::new(RecordingDevice::manual());
        let session = session_with(&["a"], ok_resolver(), device).await;
        assert!(!session.skip());
        assert_eq!(session.queue_len().await, 1);
    }

    #[tokio::test]
    async fn skip_advances_exactly_once() {
        let device = Arc::new(RecordingDevice::manual());
        let session = session_with(&["a", "b", "c"], ok_resolver(), device.clone()).await;

        let cycle = tokio::spawn({
            let session = session.clone();
            async move { session.run_cycle().await }
        });
        device.wait_for_play(WAIT).await;
        assert_eq!(session.current_item().as_deref(), Some("a"));

        assert!(session.skip());
        let outcome = tokio::time::timeout(WAIT, cycle).await.unwrap().unwrap();
        assert_eq!(outcome, CycleOutcome::Advanced);

        // A second skip has nothing loaded and must not pop "b"
        assert!(!session.skip());
        assert_eq!(session.queued_items().await, vec!["b", "c"]);
        assert_eq!(device.stops(), 1);
    }

    #[tokio::test]
    async fn stream_error_mid_playback_advances() {
        let device = Arc::new(RecordingDevice::manual());
        let session = session_with(&["a", "b"], ok_resolver(), device.clone()).await;

        let cycle = tokio::spawn({
            let session = session.clone();
            async move { session.run_cycle().await }
        });
        device.wait_for_play(WAIT).await;
        device.fail_stream("truncated opus packet");

        let outcome = tokio::time::timeout(WAIT, cycle).await.unwrap().unwrap();
        assert_eq!(outcome, CycleOutcome::Advanced);
        assert_eq!(session.queued_items().await, vec!["b"]);
        assert_eq!(session.current_item(), None);
    }

    #[tokio::test]
    async fn play_failure_advances() {
        let device = Arc::new(RecordingDevice::failing());
        let session = session_with(&["a", "b"], ok_resolver(), device).await;

        assert_eq!(session.run_cycle().await, CycleOutcome::Advanced);
        assert_eq!(session.queued_items().await, vec!["b"]);
    }

    #[tokio::test]
    async fn finish_during_resolution_is_not_lost() {
        let device = Arc::new(RecordingDevice::manual());
        let (resolver, release) = gated_resolver();
        let session = session_with(&["a", "b"], resolver, device.clone()).await;

        let cycle = tokio::spawn({
            let session = session.clone();
            async move { session.run_cycle().await }
        });
        device.wait_for_watchers(1, WAIT).await;

        device.finish();
        release.notify_one();

        let outcome = tokio::time::timeout(WAIT, cycle).await.unwrap().unwrap();
        assert_eq!(outcome, CycleOutcome::Advanced);
        assert!(device.played().is_empty());
        assert_eq!(session.queued_items().await, vec!["b"]);
    }

    #[tokio::test]
    async fn watchers_are_disarmed_after_cycle() {
        let device = Arc::new(RecordingDevice::auto_finishing());
        let session = session_with(&["a"], ok_resolver(), device.clone()).await;

        session.run_cycle().await;
        assert_eq!(device.armed_watchers(), 0);
    }

    #[tokio::test]
    async fn pause_and_unpause_report_effect() {
        let device = Arc::new(RecordingDevice::manual());
        let session = session_with(&["a"], ok_resolver(), device.clone()).await;

        assert!(!session.pause());
        assert!(!session.unpause());

        let cycle = tokio::spawn({
            let session = session.clone();
            async move { session.run_cycle().await }
        });
        device.wait_for_play(WAIT).await;

        assert!(session.pause());
        assert!(!session.pause());
        assert!(session.unpause());
        assert!(!session.unpause());

        device.finish();
        tokio::time::timeout(WAIT, cycle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn volume_is_reapplied_to_loaded_track() {
        let device = Arc::new(RecordingDevice::manual());
        let session = session_with(&["a"], ok_resolver(), device.clone()).await;

        assert!(session.set_volume(30));
        assert!(device.live_volumes().is_empty());

        let cycle = tokio::spawn({
            let session = session.clone();
            async move { session.run_cycle().await }
        });
        device.wait_for_play(WAIT).await;
        assert_eq!(device.volumes(), vec![0.3]);

        assert!(session.set_volume(80));
        assert_eq!(device.live_volumes(), vec![0.8]);

        device.finish();
        tokio::time::timeout(WAIT, cycle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn destroy_connection_is_idempotent() {
        let device = Arc::new(RecordingDevice::manual());
        let session = session_with(&[], ok_resolver(), device).await;
        assert!(!session.busy());
        assert!(!session.destroy_connection().await);

        let connection = Arc::new(FakeConnection::default());
        session.attach_connection(connection.clone());
        assert!(session.busy());

        assert!(session.destroy_connection().await);
        assert!(!session.busy());
        assert!(!session.destroy_connection().await);
        assert_eq!(connection.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn destroy_while_playing_completes_cycle() {
        let device = Arc::new(RecordingDevice::manual());
        let session = session_with(&["a", "b"], ok_resolver(), device.clone()).await;
        session.attach_connection(Arc::new(FakeConnection::default()));

        let cycle = tokio::spawn({
            let session = session.clone();
            async move { session.run_cycle().await }
        });
        device.wait_for_play(WAIT).await;

        assert!(session.destroy_connection().await);
        let outcome = tokio::time::timeout(WAIT, cycle).await.unwrap().unwrap();
        assert_eq!(outcome, CycleOutcome::Advanced);
        assert_eq!(session.current_item(), None);
        assert_eq!(session.queued_items().await, vec!["b"]);
    }

    #[tokio::test]
    async fn destroy_during_resolution_discards_result() {
        let device = Arc::new(RecordingDevice::manual());
        let (resolver, release) = gated_resolver();
        let session = session_with(&["a"], resolver, device.clone()).await;
        session.attach_connection(Arc::new(FakeConnection::default()));

        let cycle = tokio::spawn({
            let session = session.clone();
            async move { session.run_cycle().await }
        });
        device.wait_for_watchers(1, WAIT).await;

        assert!(session.destroy_connection().await);
        release.notify_one();

        let outcome = tokio::time::timeout(WAIT, cycle).await.unwrap().unwrap();
        assert_eq!(outcome, CycleOutcome::Detached);
        assert!(device.played().is_empty());
        assert_eq!(session.queued_items().await, vec!["a"]);
    }

    #[tokio::test]
    async fn driver_drains_queue_then_stops() {
        let device = Arc::new(RecordingDevice::auto_finishing());
        let session = session_with(&["a", "b", "c"], ok_resolver(), device.clone()).await;

        assert!(session.ensure_playing());

        tokio::time::timeout(WAIT, async {
            while session.driving.load(Ordering::SeqCst) || session.queue_len().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(device.played(), vec!["a", "b", "c"]);

        // Re-triggered after an append
        session.enqueue("d").await.unwrap();
        assert!(session.ensure_playing());
        tokio::time::timeout(WAIT, async {
            while device.played().len() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn append_racing_final_empty_cycle_is_played() {
        let store = Arc::new(GatedStore::default());
        let device = Arc::new(RecordingDevice::auto_finishing());
        let session = session_on(store.clone(), &["a"], ok_resolver(), device.clone()).await;

        store.hold_next_empty_peek();
        assert!(session.ensure_playing());
        store.wait_until_held(WAIT).await;

        // The driver is inside its final, empty cycle
        session.enqueue("b").await.unwrap();
        assert!(!session.ensure_playing());
        store.release();

        wait_until(|| device.played().len() == 2 && !session.is_driving()).await;
        assert_eq!(device.played(), vec!["a", "b"]);
        assert_eq!(session.queue_len().await, 0);
    }

    #[tokio::test]
    async fn rejoin_during_resolution_restarts_driver() {
        let device = Arc::new(RecordingDevice::auto_finishing());
        let (resolver, release) = gated_resolver();
        let session = session_with(&["a"], resolver, device.clone()).await;
        session.attach_connection(Arc::new(FakeConnection::default()));

        assert!(session.ensure_playing());
        device.wait_for_watchers(1, WAIT).await;
        assert!(session.destroy_connection().await);

        // Rejoin while the old driver is still waiting on the resolver
        session.attach_connection(Arc::new(FakeConnection::default()));
        session.enqueue("b").await.unwrap();
        assert!(!session.ensure_playing());

        wait_until(|| {
            release.notify_one();
            device.played().len() == 2
        })
        .await;
        assert_eq!(device.played(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn rejoin_after_leave_while_playing_keeps_playing() {
        let device = Arc::new(RecordingDevice::manual());
        let session = session_with(&["a"], ok_resolver(), device.clone()).await;
        session.attach_connection(Arc::new(FakeConnection::default()));

        assert!(session.ensure_playing());
        device.wait_for_play(WAIT).await;
        assert!(session.destroy_connection().await);

        session.attach_connection(Arc::new(FakeConnection::default()));
        session.enqueue("b").await.unwrap();
        session.ensure_playing();

        wait_until(|| device.played().len() == 2).await;
        assert_eq!(device.played(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn request_before_leave_does_not_outlive_teardown() {
        let device = Arc::new(RecordingDevice::manual());
        let session = session_with(&["a", "b"], ok_resolver(), device.clone()).await;
        session.attach_connection(Arc::new(FakeConnection::default()));

        assert!(session.ensure_playing());
        device.wait_for_play(WAIT).await;
        assert!(!session.ensure_playing());
        assert!(session.destroy_connection().await);

        wait_until(|| !session.is_driving()).await;
        assert_eq!(device.played(), vec!["a"]);
        assert_eq!(session.queued_items().await, vec!["b"]);
    }

    #[tokio::test]
    async fn shutdown_stops_driver_without_connection() {
        let device = Arc::new(RecordingDevice::manual());
        let session = session_with(&["a", "b"], ok_resolver(), device.clone()).await;

        assert!(session.ensure_playing());
        device.wait_for_play(WAIT).await;
        session.shutdown().await;

        wait_until(|| !session.is_driving()).await;
        assert_eq!(device.played(), vec!["a"]);
        assert_eq!(session.queued_items().await, vec!["b"]);
    }

    #[tokio::test]
    async fn looped_head_survives_failed_store_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonQueueStore::open(dir.path().to_path_buf()).await.unwrap());
        let device = Arc::new(RecordingDevice::auto_finishing());
        let session = session_on(store, &["a", "b"], ok_resolver(), device).await;
        session.set_loop(true);

        std::fs::remove_dir_all(dir.path().join("queues")).unwrap();

        assert_eq!(session.run_cycle().await, CycleOutcome::Advanced);
        assert_eq!(session.queued_items().await, vec!["b", "a"]);
    }
}
