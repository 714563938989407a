//! Single-flight image builds.
//!
//! At most one build per reference is in flight. The first caller for a
//! reference registers an exclusively held lock and builds; callers that
//! arrive while it runs take the lock in shared mode, which blocks them
//! until the builder is done. Followers are not told how the build went:
//! `Ok(())` from [`BuildCoordinator::ensure_built`] means "a build attempt
//! finished", and artifact presence on disk is the only source of truth.
//!
//! The registry keeps locks only for builds in flight; an entry is removed
//! when its build finishes, successfully or not.

use std::collections::HashMap;
use std::sync::Arc;

use jitreg_core::error::{GatewayError, Result};
use jitreg_core::event::{events, EventEmitter, GatewayEvent};
use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::rules::DynamicRules;
use crate::store::ImageStore;

type LockRegistry = Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>;

enum Flight {
    /// This caller created the lock and must build.
    Leader(BuildTicket),
    /// A build is already running; wait on its lock.
    Follower(Arc<RwLock<()>>),
}

/// Exclusive hold on a reference's build lock.
///
/// Dropping the ticket deregisters the reference first and then releases
/// the lock, so a build that errors, panics or is torn down never leaves a
/// stale registry entry behind.
struct BuildTicket {
    registry: LockRegistry,
    reference: String,
    guard: Option<OwnedRwLockWriteGuard<()>>,
}

impl Drop for BuildTicket {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.reference);
        self.guard.take();
    }
}

/// Deduplicates concurrent builds of the same reference.
#[derive(Clone)]
pub struct BuildCoordinator {
    rules: Arc<DynamicRules>,
    store: Arc<dyn ImageStore>,
    in_flight: LockRegistry,
    events: EventEmitter,
}

impl BuildCoordinator {
    pub fn new(rules: Arc<DynamicRules>, store: Arc<dyn ImageStore>, events: EventEmitter) -> Self {
        Self {
            rules,
            store,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Number of references with a build in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Build `repository:tag` unless a build for it is already running.
    ///
    /// The builder gets the image store's error; followers always get
    /// `Ok(())` once the in-flight build is over. No matching rule is not
    /// an error: nothing is built and the caller finds no manifest.
    ///
    /// The build runs on its own task, so it completes and releases its
    /// lock even if the calling request is dropped.
    pub async fn ensure_built(&self, repository: &str, tag: &str) -> Result<()> {
        let reference = format!("{}:{}", repository, tag);

        match self.join(&reference) {
            Flight::Follower(lock) => {
                tracing::debug!(reference = %reference, "Waiting for in-flight build");
                let _shared = lock.read().await;
                Ok(())
            }
            Flight::Leader(ticket) => {
                let this = self.clone();
                let build = tokio::spawn(async move {
                    let result = this.build(&ticket.reference).await;
                    drop(ticket);
                    result
                });
                build.await.map_err(|e| GatewayError::BuildError {
                    reference,
                    message: format!("build task aborted: {}", e),
                })?
            }
        }
    }

    /// Test-and-set the lock for `reference` in one critical section.
    fn join(&self, reference: &str) -> Flight {
        let mut in_flight = self.in_flight.lock();
        if let Some(lock) = in_flight.get(reference) {
            return Flight::Follower(Arc::clone(lock));
        }

        let lock = Arc::new(RwLock::new(()));
        match Arc::clone(&lock).try_write_owned() {
            Ok(guard) => {
                in_flight.insert(reference.to_string(), lock);
                Flight::Leader(BuildTicket {
                    registry: Arc::clone(&self.in_flight),
                    reference: reference.to_string(),
                    guard: Some(guard),
                })
            }
            // a lock nobody else has seen cannot be contended
            Err(_) => Flight::Follower(lock),
        }
    }

    async fn build(&self, reference: &str) -> Result<()> {
        let rules = self.rules.resolve();
        let Some(mutation) = rules.find(reference) else {
            tracing::info!(reference = %reference, "No rule matches reference");
            self.events
                .emit(GatewayEvent::for_reference(events::BUILD_UNMATCHED, reference));
            return Ok(());
        };

        tracing::info!(
            reference = %reference,
            base = %mutation.base_image,
            "Building image"
        );
        self.events
            .emit(GatewayEvent::for_reference(events::BUILD_STARTED, reference));

        match self.store.build(reference, &mutation).await {
            Ok(()) => {
                self.events
                    .emit(GatewayEvent::for_reference(events::BUILD_COMPLETED, reference));
                Ok(())
            }
            Err(e) => {
                tracing::error!(reference = %reference, error = %e, "Image build failed");
                self.events.emit(
                    GatewayEvent::for_reference(events::BUILD_FAILED, reference)
                        .with_detail(e.to_string()),
                );
                Err(e)
            }
        }
    }
}
