use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct WatchdogState {
    generation: u64,
    armed: Option<JoinHandle<()>>,
}

/// Inactivity timer.
///
/// Every `arm` replaces the previous timer, so the callback only runs after
/// a full `duration` with no rearm. A fire is honoured only if its generation
/// is still current; `clear` bumps the generation, so a timer that wakes
/// after being cleared does nothing.
#[derive(Clone)]
pub struct Watchdog {
    duration: Option<Duration>,
    state: Arc<Mutex<WatchdogState>>,
}

impl Watchdog {
    /// `None` disables the watchdog entirely
    pub fn new(duration: Option<Duration>) -> Self {
        Self {
            duration,
            state: Arc::new(Mutex::new(WatchdogState::default())),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// (Re)start the timer. Returns false when the watchdog is disabled.
    pub fn arm<F, Fut>(&self, on_fire: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(duration) = self.duration else {
            return false;
        };

        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        if let Some(previous) = state.armed.take() {
            previous.abort();
        }

        let watchdog = self.clone();
        state.armed = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if watchdog.claim(generation) {
                on_fire().await;
            }
        }));
        true
    }

    /// Cancel any pending timer
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        if let Some(handle) = state.armed.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Take ownership of a fire for `generation`. Only the current, still
    /// armed generation can be claimed, and only once.
    pub fn claim(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || state.armed.is_none() {
            return false;
        }
        // detach rather than abort: the claiming task is the one running
        state.armed = None;
        true
    }
}
