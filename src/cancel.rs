use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::util::lock_unpoisoned;

const DEFAULT_CANCEL_REASON: &str = "cancelled by caller";

/// Caller-owned cancellation signal. Clones observe the same signal.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel_with(DEFAULT_CANCEL_REASON);
    }

    /// Fires the signal. Only the first reason is kept.
    pub fn cancel_with(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<&str> {
        if !self.is_cancelled() {
            return None;
        }
        Some(
            self.reason
                .get()
                .map(String::as_str)
                .unwrap_or(DEFAULT_CANCEL_REASON),
        )
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn reason_or_default(&self) -> String {
        self.reason().unwrap_or(DEFAULT_CANCEL_REASON).to_owned()
    }
}

impl From<CancellationToken> for CancelSignal {
    fn from(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    Timeout(Duration),
    External(String),
}

/// The effective cancellation trigger of a single attempt: the per-attempt
/// timeout merged with the caller's [`CancelSignal`].
///
/// The watcher task owning the timer and the signal subscription lives until
/// [`release`](Self::release) is called or the value is dropped.
#[derive(Debug)]
pub struct AttemptCancellation {
    trigger: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    timeout: Duration,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl AttemptCancellation {
    /// Must be called from within a tokio runtime.
    pub fn compose(timeout: Duration, external: Option<&CancelSignal>) -> Self {
        let trigger = CancellationToken::new();
        let reason = Arc::new(OnceLock::new());

        if let Some(signal) = external.filter(|signal| signal.is_cancelled()) {
            fire(
                &trigger,
                &reason,
                CancelReason::External(signal.reason_or_default()),
            );
            return Self {
                trigger,
                reason,
                timeout,
                watcher: Mutex::new(None),
            };
        }

        let watcher = tokio::spawn(watch(
            timeout,
            external.cloned(),
            trigger.clone(),
            Arc::clone(&reason),
        ));
        Self {
            trigger,
            reason,
            timeout,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    /// Resolves once the trigger fires. Never resolves after an early release.
    pub async fn fired(&self) -> CancelReason {
        self.trigger.cancelled().await;
        self.reason
            .get()
            .cloned()
            .unwrap_or(CancelReason::Timeout(self.timeout))
    }

    pub fn is_fired(&self) -> bool {
        self.trigger.is_cancelled()
    }

    pub fn reason(&self) -> Option<&CancelReason> {
        self.reason.get()
    }

    /// Stops the timer and drops the signal subscription. Idempotent.
    pub fn release(&self) {
        if let Some(watcher) = lock_unpoisoned(&self.watcher).take() {
            watcher.abort();
        }
    }

    pub fn is_released(&self) -> bool {
        lock_unpoisoned(&self.watcher).is_none()
    }
}

impl Drop for AttemptCancellation {
    fn drop(&mut self) {
        self.release();
    }
}

async fn watch(
    timeout: Duration,
    external: Option<CancelSignal>,
    trigger: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
) {
    let external_fired = async {
        match &external {
            Some(signal) => {
                signal.cancelled().await;
                CancelReason::External(signal.reason_or_default())
            }
            None => std::future::pending().await,
        }
    };

    // Timeout wins when both are ready in the same poll.
    let fired = tokio::select! {
        biased;
        () = sleep(timeout) => CancelReason::Timeout(timeout),
        external = external_fired => external,
    };
    fire(&trigger, &reason, fired);
}

fn fire(trigger: &CancellationToken, slot: &OnceLock<CancelReason>, reason: CancelReason) {
    let _ = slot.set(reason);
    trigger.cancel();
}
