//! Digital input and output.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use strum::{Display, EnumString};

use super::Io;
use crate::error::Result;
use crate::tracing::prelude::*;

/// Logic level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DigitalState {
    #[default]
    Low,
    High,
}

impl DigitalState {
    pub fn is_high(self) -> bool {
        self == DigitalState::High
    }

    pub fn is_low(self) -> bool {
        self == DigitalState::Low
    }

    pub fn toggled(self) -> Self {
        match self {
            DigitalState::Low => DigitalState::High,
            DigitalState::High => DigitalState::Low,
        }
    }
}

impl From<bool> for DigitalState {
    fn from(value: bool) -> Self {
        if value {
            DigitalState::High
        } else {
            DigitalState::Low
        }
    }
}

impl From<DigitalState> for bool {
    fn from(value: DigitalState) -> Self {
        value.is_high()
    }
}

impl fmt::Display for DigitalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigitalState::Low => write!(f, "low"),
            DigitalState::High => write!(f, "high"),
        }
    }
}

impl FromStr for DigitalState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "0" | "false" | "off" => Ok(DigitalState::Low),
            "high" | "1" | "true" | "on" => Ok(DigitalState::High),
            other => Err(format!("not a digital state: {:?}", other)),
        }
    }
}

/// Bias applied to an input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum PullResistance {
    #[default]
    #[strum(serialize = "off", serialize = "none")]
    Off,
    #[strum(serialize = "up", serialize = "pull-up")]
    PullUp,
    #[strum(serialize = "down", serialize = "pull-down")]
    PullDown,
}

/// Event dispatched when a digital line changes level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitalStateChange {
    /// Id of the handle that observed the change
    pub source: String,
    pub state: DigitalState,
}

/// Handle returned when a listener is added, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Set of callbacks interested in events of type `E`.
///
/// Dispatch runs synchronously on the calling thread over a snapshot, so a
/// listener may add or remove listeners without deadlocking.
pub struct Listeners<E> {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(ListenerId, Callback<E>)>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            callbacks: RwLock::new(Vec::new()),
        }
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns whether the listener was present.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub fn clear(&self) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }
}

impl<E> fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

pub trait DigitalInput: Io {
    fn state(&self) -> Result<DigitalState>;

    fn pull(&self) -> PullResistance;

    fn listeners(&self) -> &Listeners<DigitalStateChange>;

    fn is_high(&self) -> Result<bool> {
        Ok(self.state()?.is_high())
    }

    fn is_low(&self) -> Result<bool> {
        Ok(self.state()?.is_low())
    }
}

pub trait DigitalOutput: Io {
    fn state(&self) -> Result<DigitalState>;

    fn set_state(&self, state: DigitalState) -> Result<()>;

    fn listeners(&self) -> &Listeners<DigitalStateChange>;

    fn high(&self) -> Result<()> {
        self.set_state(DigitalState::High)
    }

    fn low(&self) -> Result<()> {
        self.set_state(DigitalState::Low)
    }

    /// Invert the current level; returns the new level.
    fn toggle(&self) -> Result<DigitalState> {
        let next = self.state()?.toggled();
        self.set_state(next)?;
        Ok(next)
    }

    /// Drive `state` for `duration`, then drive the opposite level.
    fn pulse(&self, duration: Duration, state: DigitalState) -> Result<()> {
        self.set_state(state)?;
        thread::sleep(duration);
        self.set_state(state.toggled())
    }
}

/// Background worker polling a digital line and reporting debounced changes.
///
/// The reader runs on a dedicated thread every `interval`. A new level is
/// reported only after it has been observed continuously for `debounce`.
pub struct StateMonitor {
    name: String,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Option<ThreadId>,
}

impl StateMonitor {
    pub fn spawn<R, C>(
        name: impl Into<String>,
        interval: Duration,
        debounce: Duration,
        mut read: R,
        mut on_change: C,
    ) -> Result<Self>
    where
        R: FnMut() -> Result<DigitalState> + Send + 'static,
        C: FnMut(DigitalState) + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name(format!("monitor-{}", name))
            .spawn(move || {
                trace!(monitor = %thread_name, "State monitor started");
                let mut stable: Option<DigitalState> = None;
                let mut pending: Option<(DigitalState, Instant)> = None;

                while !stop_flag.load(Ordering::Relaxed) {
                    match read() {
                        Ok(level) => {
                            if stable.is_none() {
                                stable = Some(level);
                            } else if stable == Some(level) {
                                pending = None;
                            } else {
                                let since = match pending {
                                    Some((candidate, since)) if candidate == level => since,
                                    _ => {
                                        let now = Instant::now();
                                        pending = Some((level, now));
                                        now
                                    }
                                };
                                if since.elapsed() >= debounce {
                                    stable = Some(level);
                                    pending = None;
                                    on_change(level);
                                }
                            }
                        }
                        Err(e) => {
                            debug!(monitor = %thread_name, error = %e, "State read failed");
                        }
                    }
                    thread::sleep(interval);
                }
                trace!(monitor = %thread_name, "State monitor stopped");
            })
            .map_err(|e| crate::error::Error::io(format!("monitor-{}", name), e))?;

        let thread_id = Some(handle.thread().id());
        Ok(Self {
            name,
            stop,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    /// Stop polling and wait for the worker to exit.
    ///
    /// Safe to call from a listener running on the monitor thread itself, in
    /// which case the worker exits after the current dispatch returns.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.thread_id == Some(thread::current().id()) {
            return;
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(monitor = %self.name, "State monitor thread panicked");
            }
        }
    }
}

impl Drop for StateMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for StateMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMonitor")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_digital_state_parsing() {
        assert_eq!("HIGH".parse::<DigitalState>().unwrap(), DigitalState::High);
        assert_eq!("0".parse::<DigitalState>().unwrap(), DigitalState::Low);
        assert!("maybe".parse::<DigitalState>().is_err());
        assert_eq!(DigitalState::Low.toggled(), DigitalState::High);
        assert_eq!("pull-up".parse::<PullResistance>().unwrap(), PullResistance::PullUp);
        assert_eq!("DOWN".parse::<PullResistance>().unwrap(), PullResistance::PullDown);
    }

    #[test]
    fn test_listeners_add_remove_dispatch() {
        let listeners: Listeners<u32> = Listeners::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t = Arc::clone(&total);
        let first = listeners.add(move |v| {
            t.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t = Arc::clone(&total);
        listeners.add(move |v| {
            t.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        listeners.dispatch(&1);
        assert_eq!(total.load(Ordering::SeqCst), 11);

        assert!(listeners.remove(first));
        assert!(!listeners.remove(first));
        listeners.dispatch(&1);
        assert_eq!(total.load(Ordering::SeqCst), 21);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_monitor_reports_debounced_changes() {
        let level = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let source = Arc::clone(&level);
        let monitor = StateMonitor::spawn(
            "test",
            Duration::from_millis(1),
            Duration::from_millis(5),
            move || Ok(DigitalState::from(source.load(Ordering::SeqCst))),
            move |state| {
                let _ = tx.send(state);
            },
        )
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        level.store(true, Ordering::SeqCst);

        let change = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(change, DigitalState::High);

        monitor.stop();
        assert!(!monitor.is_running());
    }
}
