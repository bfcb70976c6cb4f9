//! Caller-side request cancellation.
//!
//! An [`AbortController`] owns the trigger, every [`AbortSignal`] cloned from it
//! observes the same state. A request carrying a fired signal fails with
//! [`HttpError::Abort`](crate::HttpError::Abort) and is never retried.

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AbortState {
    Active,
    Aborted(Option<String>),
}

/// Triggers cancellation of every request carrying one of its signals.
///
/// # Examples
///
/// ```
/// use rebound::AbortController;
///
/// let controller = AbortController::new();
/// let signal = controller.signal();
/// assert!(!signal.is_aborted());
///
/// controller.abort(Some("user navigated away".to_string()));
/// assert!(signal.is_aborted());
/// assert_eq!(signal.reason().as_deref(), Some("user navigated away"));
/// ```
#[derive(Debug)]
pub struct AbortController {
    sender: watch::Sender<AbortState>,
}

impl AbortController {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(AbortState::Active);
        Self { sender }
    }

    /// Returns a signal tied to this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Fires the signal. Only the first call records a reason.
    pub fn abort(&self, reason: Option<String>) {
        self.sender.send_if_modified(|state| {
            if *state == AbortState::Active {
                *state = AbortState::Aborted(reason);
                true
            } else {
                false
            }
        });
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observes an [`AbortController`].
#[derive(Debug, Clone)]
pub struct AbortSignal {
    receiver: watch::Receiver<AbortState>,
}

impl AbortSignal {
    /// Returns `true` once the controller has fired.
    pub fn is_aborted(&self) -> bool {
        matches!(*self.receiver.borrow(), AbortState::Aborted(_))
    }

    /// The reason passed to [`AbortController::abort`], if any.
    pub fn reason(&self) -> Option<String> {
        match &*self.receiver.borrow() {
            AbortState::Aborted(reason) => reason.clone(),
            AbortState::Active => None,
        }
    }

    /// Completes when the controller fires, yielding the abort reason.
    ///
    /// Never completes if the controller is dropped without firing.
    pub async fn aborted(&self) -> Option<String> {
        let mut receiver = self.receiver.clone();
        let fired = receiver
            .wait_for(|state| matches!(state, AbortState::Aborted(_)))
            .await
            .map(|state| match &*state {
                AbortState::Aborted(reason) => reason.clone(),
                AbortState::Active => None,
            });
        match fired {
            Ok(reason) => reason,
            Err(_) => std::future::pending().await,
        }
    }
}
