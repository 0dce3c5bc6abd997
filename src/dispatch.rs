//! Fan-out of one prepared message to many recipients
//!
//! Every recipient gets its own tokio task. A counting semaphore admits at
//! most `max_in_flight` tasks at once; each task owns its permit, so the slot
//! is returned however the task ends (success, error or panic). Outcomes are
//! streamed to the caller as tasks finish and collected into a
//! [`DispatchReport`]. One recipient failing never stops the others.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::MailProvider;
use crate::error::{MailerError, Result};
use crate::message::PreparedMail;
use crate::recipients::{Recipient, Recipients};

/// Sends in flight when the caller does not choose
pub const DEFAULT_MAX_IN_FLIGHT: usize = 5;

/// Result of sending to one recipient
#[derive(Debug)]
pub struct DispatchOutcome {
    pub recipient: Recipient,
    pub result: Result<()>,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// All outcomes of one invocation, in completion order
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<DispatchOutcome>,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn sent(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.sent()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DispatchOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn all_failed(&self) -> bool {
        self.total() > 0 && self.sent() == 0
    }

    /// Process exit code: 0 all sent, 2 partial failure, 1 nothing sent
    pub fn exit_code(&self) -> i32 {
        if self.failed() == 0 {
            0
        } else if self.all_failed() {
            1
        } else {
            2
        }
    }
}

pub struct BulkDispatcher {
    provider: Arc<dyn MailProvider>,
    max_in_flight: usize,
}

impl BulkDispatcher {
    pub fn new(provider: Arc<dyn MailProvider>, max_in_flight: usize) -> Self {
        Self {
            provider,
            max_in_flight: max_in_flight.clamp(1, Semaphore::MAX_PERMITS),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Build and send one message
    pub async fn send_one(&self, mail: &PreparedMail, to: &Recipient) -> Result<()> {
        deliver(&*self.provider, mail, to).await
    }

    /// Single recipients are sent inline; lists go through [`Self::send_all`]
    pub async fn dispatch<F>(&self, mail: PreparedMail, recipients: &Recipients, on_outcome: F) -> DispatchReport
    where
        F: FnMut(&DispatchOutcome),
    {
        match recipients {
            Recipients::Single(to) => {
                let mut on_outcome = on_outcome;
                let outcome = DispatchOutcome {
                    recipient: to.clone(),
                    result: self.send_one(&mail, to).await,
                };
                log_outcome(&outcome);
                on_outcome(&outcome);
                DispatchReport {
                    outcomes: vec![outcome],
                }
            }
            Recipients::List(list) => self.send_all(mail, list, on_outcome).await,
        }
    }

    /// Send `mail` to every recipient, at most `max_in_flight` at a time.
    ///
    /// `on_outcome` sees each outcome as soon as its send finishes. The
    /// returned report holds exactly one outcome per recipient.
    pub async fn send_all<F>(&self, mail: PreparedMail, recipients: &[Recipient], mut on_outcome: F) -> DispatchReport
    where
        F: FnMut(&DispatchOutcome),
    {
        info!(
            "Dispatching to {} recipient(s), up to {} at a time",
            recipients.len(),
            self.max_in_flight
        );

        let gate = Arc::new(Semaphore::new(self.max_in_flight));
        let mail = Arc::new(mail);
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchOutcome>();
        let mut tasks = JoinSet::new();

        let producer = async {
            let tx = tx;
            for recipient in recipients.iter().cloned() {
                let permit = match gate.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let _ = tx.send(DispatchOutcome {
                            recipient,
                            result: Err(MailerError::Unknown(format!("Admission gate closed: {}", e))),
                        });
                        continue;
                    }
                };

                let provider = Arc::clone(&self.provider);
                let mail = Arc::clone(&mail);
                let tx = tx.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let result = AssertUnwindSafe(deliver(&*provider, &mail, &recipient))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(MailerError::Unknown(format!(
                                "Send task panicked: {}",
                                panic_message(panic.as_ref())
                            )))
                        });
                    let _ = tx.send(DispatchOutcome { recipient, result });
                });
            }
        };

        let consumer = async {
            let mut outcomes = Vec::with_capacity(recipients.len());
            while let Some(outcome) = rx.recv().await {
                log_outcome(&outcome);
                on_outcome(&outcome);
                outcomes.push(outcome);
            }
            outcomes
        };

        let ((), outcomes) = tokio::join!(producer, consumer);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Send task did not complete: {}", e);
            }
        }

        let report = DispatchReport { outcomes };
        info!(
            "Dispatch finished: {} sent, {} failed, {} total",
            report.sent(),
            report.failed(),
            report.total()
        );
        report
    }
}

async fn deliver(provider: &dyn MailProvider, mail: &PreparedMail, to: &Recipient) -> Result<()> {
    let message = mail.compose_for(to.as_str());
    debug!("Sending to {} ({} bytes encoded)", to, message.raw().len());
    provider.send(&message).await
}

fn log_outcome(outcome: &DispatchOutcome) {
    match &outcome.result {
        Ok(()) => info!("Sent to {}", outcome.recipient),
        Err(e) => warn!("Failed to send to {}: {}", outcome.recipient, e),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockMailProvider;
    use crate::message::{Composition, ComposedMessage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn mail() -> PreparedMail {
        Composition::new("Subject", "Body").prepare().await.unwrap()
    }

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient::parse(&format!("user{}@example.com", i)).unwrap())
            .collect()
    }

    fn addressee(message: &ComposedMessage) -> String {
        let mime = String::from_utf8(message.to_mime().unwrap()).unwrap();
        mime.lines()
            .find_map(|l| l.strip_prefix("To: "))
            .unwrap()
            .to_string()
    }

    /// Records the peak number of concurrent sends
    #[derive(Default)]
    struct SlowProvider {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MailProvider for SlowProvider {
        async fn send(&self, _message: &ComposedMessage) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn profile_address(&self) -> Result<String> {
            Ok("me@example.com".to_string())
        }
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_ceiling() {
        let provider = Arc::new(SlowProvider::default());
        let dispatcher = BulkDispatcher::new(provider.clone(), 3);

        let report = dispatcher.send_all(mail().await, &recipients(12), |_| {}).await;

        assert_eq!(report.total(), 12);
        assert_eq!(report.sent(), 12);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 12);
        let peak = provider.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in-flight was {}", peak);
        assert!(peak >= 2, "sends never overlapped");
    }

    #[tokio::test]
    async fn test_every_outcome_is_surfaced() {
        let provider = Arc::new(SlowProvider::default());
        let dispatcher = BulkDispatcher::new(provider, DEFAULT_MAX_IN_FLIGHT);

        let mut seen = Vec::new();
        let report = dispatcher
            .send_all(mail().await, &recipients(7), |o| seen.push(o.recipient.to_string()))
            .await;

        seen.sort();
        let mut expected: Vec<String> = recipients(7).iter().map(|r| r.to_string()).collect();
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_recipient() {
        let mut provider = MockMailProvider::new();
        provider.expect_send().times(3).returning(|message| {
            if addressee(message) == "user1@example.com" {
                Err(MailerError::BadRequest("Invalid To header".to_string()))
            } else {
                Ok(())
            }
        });

        let dispatcher = BulkDispatcher::new(Arc::new(provider), 2);
        let report = dispatcher.send_all(mail().await, &recipients(3), |_| {}).await;

        assert_eq!(report.total(), 3);
        assert_eq!(report.sent(), 2);
        let failed: Vec<&str> = report.failures().map(|o| o.recipient.as_str()).collect();
        assert_eq!(failed, vec!["user1@example.com"]);
        assert_eq!(report.exit_code(), 2);
    }

    struct PanickyProvider;

    #[async_trait]
    impl MailProvider for PanickyProvider {
        async fn send(&self, message: &ComposedMessage) -> Result<()> {
            if addressee(message) == "user0@example.com" {
                panic!("provider exploded");
            }
            Ok(())
        }

        async fn profile_address(&self) -> Result<String> {
            Ok("me@example.com".to_string())
        }
    }

    #[tokio::test]
    async fn test_panicking_send_releases_its_slot() {
        // A single slot: a leaked permit would hang the remaining sends
        let dispatcher = BulkDispatcher::new(Arc::new(PanickyProvider), 1);
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.send_all(mail().await, &recipients(3), |_| {}),
        )
        .await
        .expect("dispatch hung after a panic");

        assert_eq!(report.total(), 3);
        assert_eq!(report.sent(), 2);
        let failure = report.failures().next().unwrap();
        assert!(failure.result.as_ref().unwrap_err().to_string().contains("provider exploded"));
    }

    #[tokio::test]
    async fn test_all_failed_exit_code() {
        let mut provider = MockMailProvider::new();
        provider
            .expect_send()
            .returning(|_| Err(MailerError::NetworkError("reset".to_string())));

        let dispatcher = BulkDispatcher::new(Arc::new(provider), 4);
        let report = dispatcher.send_all(mail().await, &recipients(4), |_| {}).await;
        assert!(report.all_failed());
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_single_recipient_sends_once() {
        let mut provider = MockMailProvider::new();
        provider
            .expect_send()
            .times(1)
            .withf(|message| addressee(message) == "solo@example.com")
            .returning(|_| Ok(()));

        let dispatcher = BulkDispatcher::new(Arc::new(provider), DEFAULT_MAX_IN_FLIGHT);
        let to = Recipients::Single(Recipient::parse("solo@example.com").unwrap());
        let report = dispatcher.dispatch(mail().await, &to, |_| {}).await;
        assert_eq!(report.total(), 1);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_zero_ceiling_is_clamped() {
        let dispatcher = BulkDispatcher::new(Arc::new(MockMailProvider::new()), 0);
        assert_eq!(dispatcher.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_oversized_ceiling_is_clamped() {
        let mut provider = MockMailProvider::new();
        provider.expect_send().times(2).returning(|_| Ok(()));

        let dispatcher = BulkDispatcher::new(Arc::new(provider), usize::MAX);
        assert_eq!(dispatcher.max_in_flight(), Semaphore::MAX_PERMITS);

        let report = dispatcher.send_all(mail().await, &recipients(2), |_| {}).await;
        assert_eq!(report.total(), 2);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_empty_report() {
        let report = DispatchReport::default();
        assert!(!report.all_failed());
        assert_eq!(report.exit_code(), 0);
    }
}
