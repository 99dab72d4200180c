//! Collaborator wiring.
//!
//! Every external dependency of the core — storage, remote API, clock,
//! and cancellation — is bundled into one [`Context`] threaded
//! explicitly through loader and chain calls. There is no module-level
//! mutable state.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::config::ChainConfig;
use crate::store::LocalStore;

/// A source of the current time.
///
/// The chain layer only reads the clock to expire the local tail
/// overlay; injecting it keeps that behaviour testable.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advances the clock.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

/// All collaborators the core needs, threaded explicitly.
#[derive(Clone)]
pub struct Context {
    /// Local persistent storage.
    pub store: Arc<dyn LocalStore>,

    /// Remote API client.
    pub api: Arc<dyn ApiClient>,

    /// Time source for overlay expiry.
    pub clock: Arc<dyn Clock>,

    /// Cancellation for in-flight storage and network operations.
    pub cancel: CancellationToken,

    /// Loading knobs.
    pub config: ChainConfig,
}

impl Context {
    /// Bundles collaborators with a fresh cancellation token.
    #[must_use]
    pub fn new(
        store: Arc<dyn LocalStore>,
        api: Arc<dyn ApiClient>,
        clock: Arc<dyn Clock>,
        config: ChainConfig,
    ) -> Self {
        Self {
            store,
            api,
            clock,
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Current time from the injected clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
