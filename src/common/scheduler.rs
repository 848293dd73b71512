//! Background refresh of cached keys.
//!
//! One loop runs per key family (services, configs). Every key moves
//! through `Idle → Refreshing → Idle`, or `Refreshing → Backoff → Idle`
//! when the refresh failed. Triggers that arrive while a key is refreshing
//! or backing off collapse into a single follow-up refresh, so there is
//! never more than one fetch in flight per key. Different keys refresh in
//! parallel.

use crate::api::client_config::ClientConfig;
use crate::api::error::{Error, Result};
use crate::common::backoff::Backoff;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Fetches the authoritative value of a key and stores it in a cache.
#[async_trait::async_trait]
pub(crate) trait RefreshSource: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Display + Send + Sync + 'static;

    /// Returns whether the cached value changed.
    async fn refresh(&self, key: &Self::Key) -> Result<bool>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RefreshReason {
    Periodic,
    Push,
    Subscribe,
    ColdRead,
    Confirm,
    FollowUp,
    Retry,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SchedulerSettings {
    pub(crate) backoff: Backoff,
    pub(crate) refresh_interval: Duration,
    pub(crate) drain_timeout: Duration,
}

impl SchedulerSettings {
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        SchedulerSettings {
            backoff: Backoff::from_config(config),
            refresh_interval: config.refresh_interval_duration(),
            drain_timeout: config.shutdown_timeout_duration(),
        }
    }
}

type Waiter = oneshot::Sender<Result<()>>;

enum Command<K> {
    Trigger {
        key: K,
        reason: RefreshReason,
        track: bool,
        waiter: Option<Waiter>,
    },
    Untrack(K),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Refreshing,
    Backoff,
}

struct KeyState {
    /// Refreshed periodically while tracked.
    tracked: bool,
    phase: Phase,
    /// Consecutive failed refreshes.
    attempt: u32,
    follow_up: bool,
    waiters: Vec<Waiter>,
}

impl KeyState {
    fn new() -> Self {
        KeyState {
            tracked: false,
            phase: Phase::Idle,
            attempt: 0,
            follow_up: false,
            waiters: Vec::new(),
        }
    }

    fn wanted(&self) -> bool {
        self.tracked || self.follow_up || !self.waiters.is_empty()
    }
}

/// Handle to a running refresh loop.
pub(crate) struct RefreshScheduler<K> {
    family: &'static str,
    commands: mpsc::UnboundedSender<Command<K>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<K> RefreshScheduler<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    pub(crate) fn spawn<S>(
        family: &'static str,
        source: Arc<S>,
        settings: SchedulerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self
    where
        S: RefreshSource<Key = K>,
    {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let worker = RefreshLoop {
            family,
            source,
            settings,
            keys: HashMap::new(),
            inflight: JoinSet::new(),
            timers: JoinSet::new(),
        };
        let task = tokio::spawn(worker.run(commands_rx, shutdown));
        RefreshScheduler {
            family,
            commands,
            task: Mutex::new(Some(task)),
        }
    }

    /// Keep `key` fresh in the background. The first call refreshes it at once.
    pub(crate) fn track(&self, key: K) {
        self.send(Command::Trigger {
            key,
            reason: RefreshReason::Subscribe,
            track: true,
            waiter: None,
        });
    }

    pub(crate) fn untrack(&self, key: K) {
        self.send(Command::Untrack(key));
    }

    pub(crate) fn trigger(&self, key: K, reason: RefreshReason) {
        self.send(Command::Trigger {
            key,
            reason,
            track: false,
            waiter: None,
        });
    }

    /// Refresh `key` and resolve once the refresh finished. A refresh
    /// already in flight is joined rather than repeated. Dropping the
    /// receiver does not cancel the refresh.
    pub(crate) fn request(
        &self,
        key: K,
        reason: RefreshReason,
        track: bool,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Trigger {
                key,
                reason,
                track,
                waiter: Some(tx),
            })
            .map_err(|_| Error::ClientShutdown)?;
        Ok(rx)
    }

    /// Wait for the loop to finish after shutdown was signalled.
    pub(crate) async fn join(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(family = self.family, "refresh loop ended abnormally: {}", e);
            }
        }
    }

    fn send(&self, command: Command<K>) {
        if self.commands.send(command).is_err() {
            debug!(family = self.family, "refresh trigger dropped, scheduler stopped");
        }
    }
}

struct RefreshLoop<S: RefreshSource> {
    family: &'static str,
    source: Arc<S>,
    settings: SchedulerSettings,
    keys: HashMap<S::Key, KeyState>,
    inflight: JoinSet<(S::Key, Result<bool>)>,
    timers: JoinSet<S::Key>,
}

enum Next {
    Start,
    Backoff(Duration),
    Remove,
    Stay,
}

impl<S: RefreshSource> RefreshLoop<S> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<S::Key>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut next_tick = self.next_tick();
        loop {
            tokio::select! { biased;
                _ = shutdown.changed() => break,
                Some(done) = self.inflight.join_next() => self.on_refreshed(done),
                Some(elapsed) = self.timers.join_next() => self.on_backoff_elapsed(elapsed),
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                _ = tokio::time::sleep_until(next_tick) => {
                    self.on_tick();
                    next_tick = self.next_tick();
                },
            }
        }
        self.drain(commands).await;
    }

    fn next_tick(&self) -> Instant {
        Instant::now() + self.settings.backoff.jitter(self.settings.refresh_interval)
    }

    fn on_command(&mut self, command: Command<S::Key>) {
        match command {
            Command::Trigger {
                key,
                reason,
                track,
                waiter,
            } => {
                let state = self.keys.entry(key.clone()).or_insert_with(KeyState::new);
                let newly_tracked = track && !state.tracked;
                state.tracked |= track;
                let joined = waiter.is_some();
                if reason == RefreshReason::Subscribe && !newly_tracked && !joined {
                    return;
                }
                if let Some(waiter) = waiter {
                    state.waiters.push(waiter);
                }
                let start = match state.phase {
                    Phase::Idle => true,
                    // a waiter is served by the refresh in flight
                    Phase::Refreshing => {
                        state.follow_up |= !joined;
                        false
                    }
                    Phase::Backoff => {
                        state.follow_up = true;
                        false
                    }
                };
                if start {
                    self.start(key, reason);
                } else {
                    debug!(family = self.family, %key, ?reason, "refresh trigger coalesced");
                }
            }
            Command::Untrack(key) => {
                if let Some(state) = self.keys.get_mut(&key) {
                    state.tracked = false;
                    if state.phase == Phase::Idle && !state.wanted() {
                        self.keys.remove(&key);
                    }
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let due: Vec<S::Key> = self
            .keys
            .iter()
            .filter(|(_, s)| s.tracked && s.phase == Phase::Idle)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            self.start(key, RefreshReason::Periodic);
        }
    }

    fn start(&mut self, key: S::Key, reason: RefreshReason) {
        let state = self.keys.entry(key.clone()).or_insert_with(KeyState::new);
        state.phase = Phase::Refreshing;
        state.follow_up = false;
        debug!(family = self.family, %key, ?reason, "refresh started");

        let source = self.source.clone();
        self.inflight.spawn(async move {
            let result = AssertUnwindSafe(source.refresh(&key))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::transport("refresh panicked")));
            (key, result)
        });
    }

    fn on_refreshed(&mut self, done: std::result::Result<(S::Key, Result<bool>), JoinError>) {
        match done {
            Ok((key, result)) => self.finish(key, result, true),
            Err(e) => error!(family = self.family, "refresh task aborted: {}", e),
        }
    }

    fn finish(&mut self, key: S::Key, result: Result<bool>, accepting: bool) {
        let Some(state) = self.keys.get_mut(&key) else {
            return;
        };
        let waiters = std::mem::take(&mut state.waiters);
        let next = match result {
            Ok(changed) => {
                if state.attempt > 0 {
                    info!(
                        family = self.family,
                        %key,
                        failures = state.attempt,
                        "refresh recovered"
                    );
                }
                debug!(family = self.family, %key, changed, "refresh applied");
                state.attempt = 0;
                state.phase = Phase::Idle;
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                if state.follow_up && accepting {
                    Next::Start
                } else if !state.tracked {
                    Next::Remove
                } else {
                    Next::Stay
                }
            }
            Err(e) => {
                let delay = self.settings.backoff.delay(state.attempt);
                state.attempt = state.attempt.saturating_add(1);
                warn!(
                    family = self.family,
                    %key,
                    attempt = state.attempt,
                    error = %e,
                    "refresh failed, retrying in {:?}",
                    delay
                );
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                if accepting {
                    state.phase = Phase::Backoff;
                    Next::Backoff(delay)
                } else {
                    state.phase = Phase::Idle;
                    Next::Stay
                }
            }
        };
        match next {
            Next::Start => self.start(key, RefreshReason::FollowUp),
            Next::Backoff(delay) => {
                self.timers.spawn(async move {
                    tokio::time::sleep(delay).await;
                    key
                });
            }
            Next::Remove => {
                self.keys.remove(&key);
            }
            Next::Stay => {}
        }
    }

    fn on_backoff_elapsed(&mut self, elapsed: std::result::Result<S::Key, JoinError>) {
        let Ok(key) = elapsed else {
            return;
        };
        let Some(state) = self.keys.get_mut(&key) else {
            return;
        };
        if state.phase != Phase::Backoff {
            return;
        }
        state.phase = Phase::Idle;
        if state.wanted() {
            self.start(key, RefreshReason::Retry);
        } else {
            self.keys.remove(&key);
        }
    }

    /// Stop taking triggers, let refreshes in flight finish within the
    /// drain timeout, then release everything.
    async fn drain(&mut self, mut commands: mpsc::UnboundedReceiver<Command<S::Key>>) {
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Trigger {
                waiter: Some(waiter),
                ..
            } = command
            {
                let _ = waiter.send(Err(Error::ClientShutdown));
            }
        }
        self.timers.abort_all();

        let pending = self.inflight.len();
        let drained = tokio::time::timeout(self.settings.drain_timeout, async {
            while let Some(done) = self.inflight.join_next().await {
                if let Ok((key, result)) = done {
                    self.finish(key, result, false);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                family = self.family,
                remaining = self.inflight.len(),
                "refreshes still running at shutdown, aborting"
            );
            self.inflight.abort_all();
        }
        for (_, state) in self.keys.drain() {
            for waiter in state.waiters {
                let _ = waiter.send(Err(Error::ClientShutdown));
            }
        }
        info!(family = self.family, pending, "refresh loop stopped");
    }
}
