use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::EventDispatcher;
use super::subscriber::{SessionState, Subscriber, SubscriberConfig};
use crate::core::{Error, Result, SubscriptionInfo};

/// Reconnect behavior for a [`Connector`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first reconnect attempt; doubles on each
    /// consecutive failure
    pub retry_interval: Duration,
    /// Ceiling for the backoff delay
    pub max_retry_interval: Duration,
    /// Consecutive failed attempts before giving up; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_interval
            .saturating_mul(1u32 << exponent)
            .min(self.max_retry_interval)
    }
}

/// How a single session ended, as seen by the retry loop
enum SessionOutcome {
    /// The caller cancelled; the loop should stop
    Cancelled,
    /// The channel terminated; `reached_idle` is true when the handshake
    /// completed, which resets the backoff
    Terminated { reached_idle: bool },
}

/// Maintains a long-lived subscription across connection failures.
///
/// The connector owns the retained [`SubscriptionInfo`] and replays it
/// verbatim after every reconnect, re-authenticating first when the
/// configuration carries credentials. At most one connection attempt is in
/// flight at a time, and cancellation is honored between every step.
pub struct Connector {
    config: SubscriberConfig,
    policy: RetryPolicy,
    dispatcher: EventDispatcher,
    subscription: Mutex<SubscriptionInfo>,
    cancel: CancellationToken,
}

impl Connector {
    /// Creates a connector that will maintain the given subscription
    pub fn new(
        config: SubscriberConfig,
        policy: RetryPolicy,
        subscription: SubscriptionInfo,
        dispatcher: EventDispatcher,
    ) -> Self {
        Connector {
            config,
            policy,
            dispatcher,
            subscription: Mutex::new(subscription),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the connector when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the retry loop; the active session, if any, is disconnected
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Replaces the retained subscription used for the next (re)connect
    pub fn set_subscription(&self, info: SubscriptionInfo) {
        *self.subscription.lock().expect("subscription lock poisoned") = info;
    }

    /// Runs the connect-subscribe-reconnect loop until cancelled or the
    /// retry budget is exhausted.
    ///
    /// Configuration problems that cannot heal on retry (a missing cipher,
    /// an unsupported mode word) end the loop with an error immediately.
    pub async fn run(&self) -> Result<()> {
        let mut failed_attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match self.run_session().await {
                Ok(SessionOutcome::Cancelled) => return Ok(()),
                Ok(SessionOutcome::Terminated { reached_idle }) => {
                    if reached_idle {
                        failed_attempts = 0;
                    }
                }
                Err(err @ (Error::Config(_) | Error::InvalidState(_))) => {
                    self.dispatcher.error(&err);
                    return Err(err);
                }
                Err(err) => {
                    debug!(error = %err, "connection attempt failed");
                    self.dispatcher.error(&err);
                }
            }

            failed_attempts += 1;

            if let Some(max) = self.policy.max_retries {
                if failed_attempts > max {
                    let err = Error::channel_closed(format!(
                        "giving up after {} failed connection attempts",
                        max
                    ));
                    self.dispatcher.error(&err);
                    return Err(err);
                }
            }

            let delay = self.policy.delay_for(failed_attempts);
            info!(?delay, "reconnecting after delay");
            self.dispatcher
                .status(&format!("attempting reconnect in {:.1?}", delay));

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Drives one full session: connect, handshake, subscribe, then wait
    /// for the channel to end
    async fn run_session(&self) -> Result<SessionOutcome> {
        let subscriber =
            Subscriber::connect(self.config.clone(), self.dispatcher.clone()).await?;

        // Handshake: wait for the mode negotiation to settle
        let state = tokio::select! {
            _ = self.cancel.cancelled() => None,
            state = subscriber.wait_for_state(|s| {
                matches!(
                    s,
                    SessionState::Authenticating | SessionState::Idle | SessionState::Disconnected
                )
            }) => Some(state?),
        };

        let state = match state {
            Some(state) => state,
            None => {
                subscriber.disconnect().await;
                return Ok(SessionOutcome::Cancelled);
            }
        };

        if state == SessionState::Disconnected {
            return Ok(SessionOutcome::Terminated {
                reached_idle: false,
            });
        }

        if state == SessionState::Authenticating {
            let auth_id = self
                .config
                .auth_id
                .clone()
                .ok_or_else(|| Error::config("publisher requires authentication"))?;

            subscriber.authenticate(&auth_id).await?;

            let state = tokio::select! {
                _ = self.cancel.cancelled() => None,
                state = subscriber.wait_for_state(|s| {
                    matches!(s, SessionState::Idle | SessionState::Disconnected)
                }) => Some(state?),
            };

            match state {
                Some(SessionState::Disconnected) => {
                    return Ok(SessionOutcome::Terminated {
                        reached_idle: false,
                    });
                }
                Some(_) => {}
                None => {
                    subscriber.disconnect().await;
                    return Ok(SessionOutcome::Cancelled);
                }
            }
        }

        // Cancellation is checked once more before the retained filter is
        // replayed
        if self.cancel.is_cancelled() {
            subscriber.disconnect().await;
            return Ok(SessionOutcome::Cancelled);
        }

        let info = self
            .subscription
            .lock()
            .expect("subscription lock poisoned")
            .clone();
        subscriber.subscribe(&info).await?;

        let terminated = subscriber.terminated();
        tokio::select! {
            _ = self.cancel.cancelled() => {
                subscriber.disconnect().await;
                Ok(SessionOutcome::Cancelled)
            }
            _ = terminated.cancelled() => {
                warn!("session terminated, scheduling reconnect");
                Ok(SessionOutcome::Terminated { reached_idle: true })
            }
        }
    }
}
