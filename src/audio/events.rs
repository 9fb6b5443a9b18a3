use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Playing,
    Paused,
    Buffering,
    AutoPaused,
}

/// Notification emitted by a playback device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    StateChange { old: DeviceState, new: DeviceState },
    /// Stream failure detected after playback started.
    Error(String),
}

impl DeviceEvent {
    /// The transition a device emits when a track plays to the end.
    pub fn finished() -> Self {
        Self::StateChange {
            old: DeviceState::Playing,
            new: DeviceState::Idle,
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(
            self,
            Self::StateChange {
                old: DeviceState::Playing,
                new: DeviceState::Idle
            }
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

type Filter = Box<dyn Fn(&DeviceEvent) -> bool + Send + Sync>;

struct Slot {
    id: u64,
    filter: Filter,
    tx: oneshot::Sender<DeviceEvent>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    slots: Mutex<Vec<Slot>>,
}

/// One-shot observer list for a single session's device.
///
/// A [`Watcher`] fires at most once: the first matching [`emit`](Self::emit)
/// removes it from the list before delivering the event. Dropping a watcher
/// disarms it.
#[derive(Clone, Default)]
pub struct DeviceEvents {
    inner: Arc<Inner>,
}

impl DeviceEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a watcher that fires on the first event accepted by `filter`.
    pub fn watch<F>(&self, filter: F) -> Watcher
    where
        F: Fn(&DeviceEvent) -> bool + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.slots.lock().push(Slot {
            id,
            filter: Box::new(filter),
            tx,
        });
        Watcher {
            id,
            events: self.clone(),
            rx,
        }
    }

    /// Delivers `event` to every armed watcher that accepts it and returns how
    /// many fired.
    pub fn emit(&self, event: DeviceEvent) -> usize {
        let fired: Vec<Slot> = {
            let mut slots = self.inner.slots.lock();
            let (matching, rest): (Vec<Slot>, Vec<Slot>) =
                slots.drain(..).partition(|slot| (slot.filter)(&event));
            *slots = rest;
            matching
        };

        let count = fired.len();
        for slot in fired {
            // El receptor pudo haberse descartado; no es un error
            let _ = slot.tx.send(event.clone());
        }
        debug!("📣 Evento {:?} entregado a {} watchers", event, count);
        count
    }

    /// Number of watchers still waiting.
    pub fn armed(&self) -> usize {
        self.inner.slots.lock().len()
    }

    fn remove(&self, id: u64) {
        self.inner.slots.lock().retain(|slot| slot.id != id);
    }
}

impl std::fmt::Debug for DeviceEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceEvents")
            .field("armed", &self.armed())
            .finish()
    }
}

pub struct Watcher {
    id: u64,
    events: DeviceEvents,
    rx: oneshot::Receiver<DeviceEvent>,
}

impl Watcher {
    /// Waits until the watcher fires. `None` if it was disarmed first.
    pub async fn fired(&mut self) -> Option<DeviceEvent> {
        (&mut self.rx).await.ok()
    }

    /// Returns the event if the watcher already fired.
    pub fn try_fired(&mut self) -> Option<DeviceEvent> {
        self.rx.try_recv().ok()
    }

    pub fn disarm(&self) {
        self.events.remove(self.id);
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.disarm();
    }
}
