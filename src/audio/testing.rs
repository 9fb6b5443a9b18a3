//! Test doubles shared by the session and registry tests.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::connection::VoiceConnection;
use super::device::PlaybackDevice;
use super::events::{DeviceEvent, DeviceEvents, DeviceState};
use crate::error::JukeboxResult;
use crate::sources::{MockResourceResolver, PlayableResource, ResourceResolver};
use crate::storage::{MemoryQueueStore, QueueKey, QueueStore};

/// Resolver that turns every id into `https://cdn.test/<id>`.
pub(crate) fn ok_resolver() -> MockResourceResolver {
    let mut resolver = MockResourceResolver::new();
    resolver
        .expect_resolve()
        .returning(|id| Ok(PlayableResource::new(id, format!("https://cdn.test/{id}"))));
    resolver
}

/// Resolver that blocks until the returned [`Notify`] is signalled.
pub(crate) fn gated_resolver() -> (GatedResolver, Arc<Notify>) {
    let gate = Arc::new(Notify::new());
    (GatedResolver { gate: gate.clone() }, gate)
}

pub(crate) struct GatedResolver {
    gate: Arc<Notify>,
}

#[async_trait]
impl ResourceResolver for GatedResolver {
    async fn resolve(&self, item_id: &str) -> JukeboxResult<PlayableResource> {
        self.gate.notified().await;
        Ok(PlayableResource::new(item_id, format!("https://cdn.test/{item_id}")))
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    /// Emits `Playing -> Idle` as soon as `play` is called.
    AutoFinish,
    /// Waits for the test to call `finish` or `fail_stream`.
    Manual,
    /// `play` returns an error.
    Failing,
}

/// Records every call a session makes against it.
pub(crate) struct RecordingDevice {
    mode: Mode,
    events: Mutex<Option<DeviceEvents>>,
    state: Mutex<DeviceState>,
    played: Mutex<Vec<String>>,
    volumes: Mutex<Vec<f32>>,
    live_volumes: Mutex<Vec<f32>>,
    stops: AtomicUsize,
    play_started: Notify,
}

impl RecordingDevice {
    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            events: Mutex::new(None),
            state: Mutex::new(DeviceState::Idle),
            played: Mutex::new(Vec::new()),
            volumes: Mutex::new(Vec::new()),
            live_volumes: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            play_started: Notify::new(),
        }
    }

    pub(crate) fn auto_finishing() -> Self {
        Self::with_mode(Mode::AutoFinish)
    }

    pub(crate) fn manual() -> Self {
        Self::with_mode(Mode::Manual)
    }

    pub(crate) fn failing() -> Self {
        Self::with_mode(Mode::Failing)
    }

    fn emit(&self, event: DeviceEvent) {
        let events = self.events.lock().clone();
        if let Some(events) = events {
            events.emit(event);
        }
    }

    /// Natural end of the loaded track.
    pub(crate) fn finish(&self) {
        *self.state.lock() = DeviceState::Idle;
        self.emit(DeviceEvent::finished());
    }

    pub(crate) fn fail_stream(&self, reason: &str) {
        *self.state.lock() = DeviceState::Idle;
        self.emit(DeviceEvent::Error(reason.to_string()));
    }

    pub(crate) async fn wait_for_play(&self, timeout: Duration) {
        tokio::time::timeout(timeout, self.play_started.notified())
            .await
            .expect("play was never called");
    }

    pub(crate) async fn wait_for_watchers(&self, count: usize, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            while self.armed_watchers() < count {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("watchers were never armed");
    }

    pub(crate) fn armed_watchers(&self) -> usize {
        self.events.lock().as_ref().map_or(0, |events| events.armed())
    }

    pub(crate) fn played(&self) -> Vec<String> {
        self.played.lock().clone()
    }

    pub(crate) fn volumes(&self) -> Vec<f32> {
        self.volumes.lock().clone()
    }

    pub(crate) fn live_volumes(&self) -> Vec<f32> {
        self.live_volumes.lock().clone()
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackDevice for RecordingDevice {
    fn attach(&self, events: DeviceEvents) {
        *self.events.lock() = Some(events);
    }

    async fn play(&self, resource: &PlayableResource, volume: f32) -> Result<()> {
        if self.mode == Mode::Failing {
            anyhow::bail!("no voice call for guild");
        }

        self.played.lock().push(resource.item_id.clone());
        self.volumes.lock().push(volume);
        *self.state.lock() = DeviceState::Playing;
        self.play_started.notify_one();

        if self.mode == Mode::AutoFinish {
            self.finish();
        }
        Ok(())
    }

    fn pause(&self) -> bool {
        let mut state = self.state.lock();
        if *state != DeviceState::Playing {
            return false;
        }
        *state = DeviceState::Paused;
        true
    }

    fn unpause(&self) -> bool {
        let mut state = self.state.lock();
        if *state != DeviceState::Paused {
            return false;
        }
        *state = DeviceState::Playing;
        true
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = DeviceState::Idle;
    }

    fn set_volume(&self, volume: f32) {
        self.live_volumes.lock().push(volume);
    }

    fn state(&self) -> DeviceState {
        *self.state.lock()
    }
}

/// Connection that only counts teardowns.
#[derive(Default)]
pub(crate) struct FakeConnection {
    destroyed: AtomicBool,
    destroy_calls: AtomicUsize,
}

impl FakeConnection {
    pub(crate) fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceConnection for FakeConnection {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    async fn destroy(&self) -> Result<bool> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(!self.destroyed.swap(true, Ordering::SeqCst))
    }
}

/// Memory store that can hold the next empty `peek_first` until released.
#[derive(Default)]
pub(crate) struct GatedStore {
    inner: MemoryQueueStore,
    hold_empty_peek: AtomicBool,
    held: Notify,
    gate: Notify,
}

impl GatedStore {
    pub(crate) fn hold_next_empty_peek(&self) {
        self.hold_empty_peek.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn wait_until_held(&self, timeout: Duration) {
        tokio::time::timeout(timeout, self.held.notified())
            .await
            .expect("empty peek was never held");
    }

    pub(crate) fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl QueueStore for GatedStore {
    async fn peek_first(&self, key: &QueueKey) -> Result<Option<String>> {
        let head = self.inner.peek_first(key).await?;
        if head.is_none() && self.hold_empty_peek.swap(false, Ordering::SeqCst) {
            self.held.notify_one();
            self.gate.notified().await;
        }
        Ok(head)
    }

    async fn len(&self, key: &QueueKey) -> Result<usize> {
        self.inner.len(key).await
    }

    async fn push(&self, key: &QueueKey, item_id: &str) -> Result<()> {
        self.inner.push(key, item_id).await
    }

    async fn pop_first(&self, key: &QueueKey) -> Result<Option<String>> {
        self.inner.pop_first(key).await
    }

    async fn clear(&self, key: &QueueKey) -> Result<usize> {
        self.inner.clear(key).await
    }

    async fn items(&self, key: &QueueKey) -> Result<Vec<String>> {
        self.inner.items(key).await
    }
}
