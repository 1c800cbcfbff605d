//! Update Coordinator
//!
//! Runs the check → download → verify → activate cycle and owns the active
//! version pointer. At most one cycle runs at a time; a check requested while
//! one is in flight gets `Busy` instead of queuing.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::cache::{BundleCache, CacheEntry, RetentionPolicy};
use super::descriptor::{BundleSelector, VersionId};
use super::download::BundleSource;
use super::events::{EventEmitter, UpdateEvent};
use super::state::{ActivePointer, UpdatePhase};
use crate::engine::error::{Result, UpdateError};

/// Result of a completed (non-failing) check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// A newer bundle was downloaded, verified and activated
    Updated { version: VersionId },
    /// The remote bundle is not newer than the active one
    NoUpdate,
    /// Another cycle is in flight; nothing was started
    Busy,
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub retention: RetentionPolicy,
    /// Unconfirmed launches of the active bundle before rolling back on open.
    /// Zero disables the guard.
    pub max_failed_launches: u32,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            max_failed_launches: 3,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Current phase plus the emitter that announces transitions
#[derive(Debug)]
struct PhaseCell {
    phase: Mutex<UpdatePhase>,
    events: Arc<EventEmitter>,
}

impl PhaseCell {
    fn get(&self) -> UpdatePhase {
        *lock(&self.phase)
    }

    fn transition(&self, next: UpdatePhase) {
        let mut phase = lock(&self.phase);
        Self::set(&mut phase, next, &self.events);
    }

    fn set(phase: &mut UpdatePhase, next: UpdatePhase, events: &EventEmitter) {
        if *phase == next {
            return;
        }
        if !phase.can_transition_to(next) {
            warn!(from = ?*phase, to = ?next, "unexpected update phase transition");
        }
        debug!(from = ?*phase, to = ?next, "update phase");
        *phase = next;
        events.emit(UpdateEvent::PhaseChanged { phase: next });
    }
}

/// Returns the phase to Idle however the cycle ends, including when the
/// cycle future is dropped.
struct CycleGuard {
    cell: Arc<PhaseCell>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.cell.transition(UpdatePhase::Idle);
    }
}

/// What a cycle resolves its bundle from
#[derive(Debug, Clone)]
enum CycleRequest {
    /// The configured package; installs only newer versions
    Check,
    /// A bundle the developer picked; installed whatever its version
    Install {
        package_id: String,
        selector: BundleSelector,
    },
}

/// An admitted update cycle
struct Cycle {
    id: Uuid,
    guard: CycleGuard,
    cancelled: watch::Receiver<bool>,
}

pub struct UpdateCoordinator<S> {
    source: S,
    cache: BundleCache,
    events: Arc<EventEmitter>,
    options: CoordinatorOptions,
    phase: Arc<PhaseCell>,
    pointer: Mutex<ActivePointer>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
}

impl<S: BundleSource> UpdateCoordinator<S> {
    /// Load the active pointer and bring it back to a known-good version:
    /// roll back after too many unconfirmed launches, and drop versions whose
    /// cache entry has gone missing.
    pub fn open(
        source: S,
        cache: BundleCache,
        events: Arc<EventEmitter>,
        options: CoordinatorOptions,
    ) -> Result<Self> {
        let manifest_path = cache.manifest_path();
        let mut pointer = ActivePointer::load(&manifest_path)?;
        let mut dirty = false;

        if pointer.should_rollback(options.max_failed_launches) {
            let failed = pointer.abandon();
            let now_active = pointer.active.clone();
            warn!(
                failed = ?failed,
                active = ?now_active,
                attempts = options.max_failed_launches,
                "active bundle never confirmed a launch, rolling back"
            );
            if let Some(bad) = &failed {
                if let Err(e) = cache.remove(bad) {
                    warn!(version = %bad, error = %e, "failed to remove abandoned bundle");
                }
            }
            events.emit(UpdateEvent::RolledBack {
                version: now_active,
                reason: format!(
                    "bundle {} failed to launch",
                    failed.map(|v| v.to_string()).unwrap_or_default()
                ),
            });
            dirty = true;
        }

        while let Some(active) = pointer.active.clone() {
            if cache.get(&active).is_some_and(|e| e.verified) {
                break;
            }
            let now_active = pointer.fall_back().cloned();
            warn!(missing = %active, active = ?now_active, "active bundle missing from cache");
            events.emit(UpdateEvent::RolledBack {
                version: now_active,
                reason: format!("bundle {} missing from cache", active),
            });
            dirty = true;
        }

        if let Some(previous) = pointer.previous.clone() {
            if cache.get(&previous).is_none() {
                debug!(version = %previous, "previous bundle no longer cached");
                pointer.previous = None;
                dirty = true;
            }
        }

        if dirty {
            pointer.save(&manifest_path)?;
        }
        info!(active = ?pointer.active, previous = ?pointer.previous, "update coordinator ready");

        Ok(Self {
            source,
            cache,
            phase: Arc::new(PhaseCell {
                phase: Mutex::new(UpdatePhase::Idle),
                events: Arc::clone(&events),
            }),
            events,
            options,
            pointer: Mutex::new(pointer),
            cancel: Mutex::new(None),
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn cache(&self) -> &BundleCache {
        &self.cache
    }

    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.events
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase.get()
    }

    pub fn pointer(&self) -> ActivePointer {
        lock(&self.pointer).clone()
    }

    pub fn active_version(&self) -> Option<VersionId> {
        lock(&self.pointer).active.clone()
    }

    /// Cache entry of the active bundle; `None` means the embedded bundle
    pub fn active_entry(&self) -> Option<CacheEntry> {
        self.active_version().and_then(|v| self.cache.get(&v))
    }

    /// Run one update cycle to completion
    pub async fn check_for_update(&self) -> Result<CheckOutcome> {
        match self.begin_cycle() {
            Some(cycle) => self.run_cycle(cycle, CycleRequest::Check).await,
            None => Ok(self.busy()),
        }
    }

    /// Download, verify and activate a chosen bundle of any package at the
    /// storage location. Runs as a regular cycle, so it is single-flight and
    /// cancellable. Reports `NoUpdate` only when that bundle is already active.
    pub async fn install(&self, package_id: &str, selector: BundleSelector) -> Result<CheckOutcome> {
        match self.begin_cycle() {
            Some(cycle) => {
                let request = CycleRequest::Install {
                    package_id: package_id.to_string(),
                    selector,
                };
                self.run_cycle(cycle, request).await
            }
            None => Ok(self.busy()),
        }
    }

    /// Start a cycle on the current runtime without waiting for it. Whether
    /// the request was admitted is decided before this returns.
    pub fn spawn_check(self: &Arc<Self>) -> JoinHandle<Result<CheckOutcome>>
    where
        S: 'static,
    {
        self.spawn_check_on(&Handle::current())
    }

    pub fn spawn_check_on(self: &Arc<Self>, handle: &Handle) -> JoinHandle<Result<CheckOutcome>>
    where
        S: 'static,
    {
        match self.begin_cycle() {
            Some(cycle) => {
                let this = Arc::clone(self);
                handle.spawn(async move { this.run_cycle(cycle, CycleRequest::Check).await })
            }
            None => {
                let outcome = self.busy();
                handle.spawn(async move { Ok(outcome) })
            }
        }
    }

    /// Abort the in-flight cycle. Returns false when nothing was running.
    pub fn cancel(&self) -> bool {
        match lock(&self.cancel).as_ref() {
            Some(sender) => sender.send(true).is_ok(),
            None => false,
        }
    }

    fn busy(&self) -> CheckOutcome {
        debug!("update check rejected, cycle in flight");
        self.events.emit(UpdateEvent::Busy);
        CheckOutcome::Busy
    }

    fn begin_cycle(&self) -> Option<Cycle> {
        let mut phase = lock(&self.phase.phase);
        if !phase.is_idle() {
            return None;
        }
        PhaseCell::set(&mut phase, UpdatePhase::Checking, &self.events);

        let (sender, cancelled) = watch::channel(false);
        *lock(&self.cancel) = Some(sender);

        Some(Cycle {
            id: Uuid::new_v4(),
            guard: CycleGuard {
                cell: Arc::clone(&self.phase),
            },
            cancelled,
        })
    }

    async fn run_cycle(&self, cycle: Cycle, request: CycleRequest) -> Result<CheckOutcome> {
        let Cycle {
            id,
            guard,
            mut cancelled,
        } = cycle;
        let started = Instant::now();

        let result = async {
            debug!(?request, "update cycle started");
            self.events.emit(UpdateEvent::CheckStarted);
            let cancel_requested = async {
                // A dropped sender never cancels
                let closed = cancelled.wait_for(|c| *c).await.is_err();
                if closed {
                    std::future::pending::<()>().await;
                }
            };

            let result = tokio::select! {
                biased;
                _ = cancel_requested => Err(UpdateError::Cancelled),
                r = self.cycle_steps(&request) => r,
            };

            match &result {
                Ok(outcome) => {
                    info!(?outcome, elapsed_ms = started.elapsed().as_millis() as u64, "update cycle finished");
                }
                Err(UpdateError::Cancelled) => {
                    info!("update cycle cancelled");
                    self.events.emit(UpdateEvent::Cancelled);
                }
                Err(e) => {
                    warn!(code = e.code(), error = %e, "update cycle failed");
                    if self.phase().can_transition_to(UpdatePhase::Failed) {
                        self.phase.transition(UpdatePhase::Failed);
                    }
                    self.events.emit(UpdateEvent::Failed {
                        code: e.code().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
            result
        }
        .instrument(info_span!("update_cycle", cycle = %id))
        .await;

        lock(&self.cancel).take();
        drop(guard);
        result
    }

    async fn cycle_steps(&self, request: &CycleRequest) -> Result<CheckOutcome> {
        let descriptor = match request {
            CycleRequest::Check => self.source.fetch_metadata().await?,
            CycleRequest::Install {
                package_id,
                selector,
            } => self.source.fetch_metadata_for(package_id, selector).await?,
        };
        self.note_check();

        let version = descriptor.version_id.clone();
        let current = self.active_version();
        let up_to_date = match request {
            CycleRequest::Check => {
                if self.pointer().is_failed(&version) {
                    info!(remote = %version, "remote bundle failed to launch before, not reinstalling");
                    true
                } else {
                    current.as_ref().is_some_and(|c| !version.is_newer_than(c))
                }
            }
            CycleRequest::Install { .. } => current.as_ref() == Some(&version),
        };
        if up_to_date {
            info!(remote = %version, active = ?current, "no update available");
            self.events.emit(UpdateEvent::NoUpdate { current });
            return Ok(CheckOutcome::NoUpdate);
        }

        let cached = self
            .cache
            .get(&version)
            .filter(|e| e.verified && e.checksum.eq_ignore_ascii_case(&descriptor.checksum));

        let reused = match cached {
            Some(entry) => {
                debug!(version = %version, "bundle already cached, skipping download");
                self.phase.transition(UpdatePhase::Verifying);
                match self.cache.verify_integrity(&entry) {
                    Ok(()) => true,
                    Err(e @ UpdateError::ChecksumMismatch { .. }) => {
                        warn!(version = %version, error = %e, "cached bundle is corrupt, downloading again");
                        self.cache.remove(&version)?;
                        false
                    }
                    Err(e) => return Err(e),
                }
            }
            None => false,
        };

        if !reused {
            self.phase.transition(UpdatePhase::Downloading);
            let events = &self.events;
            let bytes = self
                .source
                .fetch_artifact(&descriptor, |downloaded, total| {
                    events.emit(UpdateEvent::DownloadProgress { downloaded, total });
                })
                .await?;

            self.phase.transition(UpdatePhase::Verifying);
            self.cache.store(&descriptor, &bytes)?;
        }

        self.phase.transition(UpdatePhase::Activating);
        self.activate_entry(&version)?;
        Ok(CheckOutcome::Updated { version })
    }

    fn note_check(&self) {
        let mut pointer = lock(&self.pointer);
        pointer.record_check();
        if let Err(e) = pointer.save(&self.cache.manifest_path()) {
            warn!(error = %e, "failed to record update check");
        }
    }

    /// Flip the pointer to a verified cached version. On any failure the
    /// pointer keeps (or returns to) the previously active version.
    fn activate_entry(&self, version: &VersionId) -> Result<()> {
        let entry = self.cache.get(version).ok_or_else(|| UpdateError::Activation {
            version: version.to_string(),
            reason: "not in cache".to_string(),
        })?;
        if !entry.verified {
            return Err(UpdateError::Activation {
                version: version.to_string(),
                reason: "cache entry is not verified".to_string(),
            });
        }

        let pinned: Vec<VersionId> = {
            let mut pointer = lock(&self.pointer);
            let before = pointer.clone();
            pointer.activate(version.clone());
            if let Err(e) = pointer.save(&self.cache.manifest_path()) {
                *pointer = before;
                return Err(UpdateError::Activation {
                    version: version.to_string(),
                    reason: format!("could not persist active pointer: {}", e),
                });
            }
            pointer
                .active
                .iter()
                .chain(pointer.previous.iter())
                .cloned()
                .collect()
        };

        info!(version = %version, "bundle activated");
        self.events.emit(UpdateEvent::Ready {
            version: version.clone(),
        });

        let pinned_refs: Vec<&VersionId> = pinned.iter().collect();
        if let Err(e) = self.cache.evict(&self.options.retention, &pinned_refs) {
            warn!(error = %e, "cache eviction failed");
        }
        Ok(())
    }

    /// Run `op` while holding the phase idle, so no cycle can start meanwhile
    fn exclusive<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let phase = lock(&self.phase.phase);
        if !phase.is_idle() {
            self.events.emit(UpdateEvent::Busy);
            return Err(UpdateError::Busy);
        }
        let result = op();
        drop(phase);

        if let Err(e) = &result {
            self.events.emit(UpdateEvent::Failed {
                code: e.code().to_string(),
                reason: e.to_string(),
            });
        }
        result
    }

    /// Activate an already cached version
    pub fn activate(&self, version: &VersionId) -> Result<()> {
        self.exclusive(|| self.activate_entry(version))
    }

    /// Re-activate the previous version
    pub fn rollback(&self) -> Result<VersionId> {
        self.exclusive(|| {
            let mut pointer = lock(&self.pointer);
            let previous = pointer.previous.clone().ok_or_else(|| UpdateError::Activation {
                version: "previous".to_string(),
                reason: "no previous version to roll back to".to_string(),
            })?;
            if !self.cache.get(&previous).is_some_and(|e| e.verified) {
                return Err(UpdateError::Activation {
                    version: previous.to_string(),
                    reason: "not in cache".to_string(),
                });
            }

            let before = pointer.clone();
            pointer.rollback();
            if let Err(e) = pointer.save(&self.cache.manifest_path()) {
                *pointer = before;
                return Err(e);
            }
            drop(pointer);

            info!(version = %previous, "rolled back");
            self.events.emit(UpdateEvent::RolledBack {
                version: Some(previous.clone()),
                reason: "manual rollback".to_string(),
            });
            Ok(previous)
        })
    }

    /// Return to the bundle embedded in the application
    pub fn reset(&self) -> Result<()> {
        self.exclusive(|| {
            let mut pointer = lock(&self.pointer);
            let before = pointer.clone();
            pointer.reset();
            if let Err(e) = pointer.save(&self.cache.manifest_path()) {
                *pointer = before;
                return Err(e);
            }
            drop(pointer);

            info!("reset to embedded bundle");
            self.events.emit(UpdateEvent::RolledBack {
                version: None,
                reason: "reset".to_string(),
            });
            Ok(())
        })
    }

    /// Count a launch of the active bundle; unconfirmed launches trigger a
    /// rollback on the next `open`.
    pub fn record_launch(&self) -> Result<u32> {
        let mut pointer = lock(&self.pointer);
        if pointer.active.is_none() {
            return Ok(0);
        }
        let attempts = pointer.record_launch();
        pointer.save(&self.cache.manifest_path())?;
        Ok(attempts)
    }

    /// The active bundle started fine
    pub fn confirm_launch(&self) -> Result<()> {
        let mut pointer = lock(&self.pointer);
        if pointer.launch_attempts == 0 {
            return Ok(());
        }
        pointer.confirm_launch();
        pointer.save(&self.cache.manifest_path())
    }

    /// Apply the retention policy now
    pub fn evict(&self) -> Result<Vec<VersionId>> {
        self.exclusive(|| {
            let pointer = self.pointer();
            let pinned: Vec<&VersionId> =
                pointer.active.iter().chain(pointer.previous.iter()).collect();
            self.cache.evict(&self.options.retention, &pinned)
        })
    }
}
