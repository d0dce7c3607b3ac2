//! Repeats a chain check until it yields, with cooperative cancellation.

use crate::{
    observation::{Detected, Observation, ObservationError, ObservationResult},
    Leg, Timestamp,
};
use futures::future::{self, select_all, Future, FutureExt};
use std::{collections::HashMap, fmt, time::Duration};
use tokio::sync::{oneshot, watch};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollParams {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
    /// Wall-clock time after which no further attempt is made.
    pub deadline: Option<Timestamp>,
}

impl PollParams {
    pub fn every(interval: Duration) -> Self {
        PollParams {
            interval,
            max_attempts: None,
            deadline: None,
        }
    }

    pub fn with_max_attempts(self, max_attempts: Option<u32>) -> Self {
        PollParams {
            max_attempts,
            ..self
        }
    }

    pub fn until(self, deadline: Timestamp) -> Self {
        PollParams {
            deadline: Some(deadline),
            ..self
        }
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    Detected(Detected),
    /// A terminal observation error.
    Failed(ObservationError),
    AttemptsExhausted { attempts: u32 },
    DeadlineReached,
    Canceled,
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollOutcome::Detected(detected) => write!(f, "detected in {}", detected.tx_id),
            PollOutcome::Failed(e) => write!(f, "{}", e),
            PollOutcome::AttemptsExhausted { attempts } => {
                write!(f, "nothing detected after {} attempts", attempts)
            }
            PollOutcome::DeadlineReached => f.write_str("deadline reached"),
            PollOutcome::Canceled => f.write_str("canceled"),
        }
    }
}

/// Invokes `check` every `params.interval` until it detects something or
/// fails terminally.
///
/// `NotYet` and transient errors are retried while the attempt budget and
/// the deadline allow. Cancellation interrupts both an in-flight check and
/// the sleep in between.
pub async fn poll<F, Fut>(mut check: F, params: PollParams, mut cancel: CancelToken) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ObservationResult>,
{
    let mut attempts = 0u32;

    loop {
        if cancel.is_canceled() {
            return PollOutcome::Canceled;
        }
        if let Some(deadline) = params.deadline {
            if deadline.has_passed(Timestamp::now()) {
                return PollOutcome::DeadlineReached;
            }
        }

        attempts += 1;

        let result = tokio::select! {
            result = check() => result,
            _ = cancel.canceled() => return PollOutcome::Canceled,
        };

        match result {
            Ok(Observation::Detected(detected)) => return PollOutcome::Detected(detected),
            Ok(Observation::NotYet) => {
                tracing::trace!("attempt {}: not yet", attempts);
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("attempt {} failed, retrying: {:#}", attempts, e);
            }
            Err(e) => return PollOutcome::Failed(e),
        }

        if let Some(max_attempts) = params.max_attempts {
            if attempts >= max_attempts {
                return PollOutcome::AttemptsExhausted { attempts };
            }
        }

        let sleep = match params.deadline {
            Some(deadline) => params.interval.min(Timestamp::now().until(deadline)),
            None => params.interval,
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {},
            _ = cancel.canceled() => return PollOutcome::Canceled,
        }
    }
}

/// Triggers the tokens created alongside it.
#[derive(Debug)]
pub struct Canceller(watch::Sender<bool>);

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Observes one or several cancellation sources.
///
/// Dropping a [`Canceller`] without calling `cancel` never cancels.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    sources: Vec<watch::Receiver<bool>>,
}

pub fn cancellation() -> (Canceller, CancelToken) {
    let (sender, receiver) = watch::channel(false);

    (Canceller(sender), CancelToken {
        sources: vec![receiver],
    })
}

impl CancelToken {
    pub fn never() -> Self {
        CancelToken::default()
    }

    /// A token canceled as soon as either `self` or `other` is.
    pub fn or(mut self, other: CancelToken) -> Self {
        self.sources.extend(other.sources);
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.sources.iter().any(|source| *source.borrow())
    }

    /// Resolves once canceled, never if all cancellers are gone.
    pub async fn canceled(&mut self) {
        loop {
            if self.is_canceled() {
                return;
            }
            if self.sources.is_empty() {
                return future::pending().await;
            }

            let (result, index, _) = select_all(
                self.sources
                    .iter_mut()
                    .map(|source| source.changed().boxed()),
            )
            .await;

            if result.is_err() {
                self.sources.remove(index);
            }
        }
    }
}

/// At most one background task per leg.
///
/// Spawning a task for a leg cancels the task previously spawned for it.
/// Results are delivered through a oneshot channel instead of callbacks.
#[derive(Debug, Default)]
pub struct LegTasks {
    cancellers: HashMap<Leg, Canceller>,
}

impl LegTasks {
    /// Cancels whatever runs for `leg` and returns the token for its
    /// successor.
    pub fn supersede(&mut self, leg: Leg) -> CancelToken {
        let (canceller, token) = cancellation();

        if let Some(previous) = self.cancellers.insert(leg, canceller) {
            tracing::debug!("superseding {} leg task", leg);
            previous.cancel();
        }

        token
    }

    pub fn spawn<T, Fut>(&mut self, leg: Leg, task: T) -> oneshot::Receiver<Fut::Output>
    where
        T: FnOnce(CancelToken) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let token = self.supersede(leg);
        let (sender, receiver) = oneshot::channel();
        let task = task(token);

        tokio::spawn(async move {
            let _ = sender.send(task.await);
        });

        receiver
    }

    pub fn cancel(&mut self, leg: Leg) {
        if let Some(canceller) = self.cancellers.remove(&leg) {
            canceller.cancel();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, canceller) in self.cancellers.drain() {
            canceller.cancel();
        }
    }
}
