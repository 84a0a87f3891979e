//! Convergence waiter.
//!
//! Polls a [`StatusProber`] until the observed status enters the target set,
//! leaves the pending set, or the deadline passes. Remote creates and deletes
//! are asynchronous: a returned API call does not mean the object is usable.
//!
//! State transitions per probe:
//! - status in target: success (after `continuous_target_occurrence` hits in a row)
//! - status in pending: sleep `poll_interval`, probe again
//! - not-found sentinel in neither set: tolerated `not_found_checks` times, then `NotFound`
//! - anything else: `ConvergenceFailed`
//! - deadline passed while pending: `ConvergenceTimedOut`

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConfigError, ConvergeError, Result};
use crate::remote::{RemoteObject, ResourceId};
use crate::status::{Probe, Status, StatusProber};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_NOT_FOUND_CHECKS: u32 = 20;
/// Deadline used when a timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Parameters for a single wait.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitSpec {
    pending: BTreeSet<Status>,
    target: BTreeSet<Status>,
    timeout: Duration,
    poll_interval: Duration,
    delay: Duration,
    not_found_checks: u32,
    continuous_target_occurrence: u32,
}

impl WaitSpec {
    /// Create a spec. Pending and target must be disjoint and target non-empty.
    pub fn new<P, T>(pending: P, target: T, timeout: Duration) -> std::result::Result<Self, ConfigError>
    where
        P: IntoIterator,
        P::Item: Into<Status>,
        T: IntoIterator,
        T::Item: Into<Status>,
    {
        let pending: BTreeSet<Status> = pending.into_iter().map(Into::into).collect();
        let target: BTreeSet<Status> = target.into_iter().map(Into::into).collect();

        if target.is_empty() {
            return Err(ConfigError::EmptyTarget);
        }
        if let Some(overlap) = pending.intersection(&target).next() {
            return Err(ConfigError::OverlappingStates(overlap.clone()));
        }

        Ok(Self {
            pending,
            target,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            delay: Duration::ZERO,
            not_found_checks: DEFAULT_NOT_FOUND_CHECKS,
            continuous_target_occurrence: 1,
        })
    }

    /// Wait for an object to disappear: the not-found sentinel is the target.
    pub fn deleted<P>(pending: P, timeout: Duration) -> std::result::Result<Self, ConfigError>
    where
        P: IntoIterator,
        P::Item: Into<Status>,
    {
        Self::new(pending, [Status::not_found()], timeout)
    }

    pub fn poll_interval(mut self, interval: Duration) -> std::result::Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "poll_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        self.poll_interval = interval;
        Ok(self)
    }

    /// Initial delay before the first probe.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    pub fn continuous_target_occurrence(
        mut self,
        occurrences: u32,
    ) -> std::result::Result<Self, ConfigError> {
        if occurrences == 0 {
            return Err(ConfigError::Invalid {
                field: "continuous_target_occurrence",
                reason: "must be at least 1".to_string(),
            });
        }
        self.continuous_target_occurrence = occurrences;
        Ok(self)
    }

    pub fn pending(&self) -> &BTreeSet<Status> {
        &self.pending
    }

    pub fn target(&self) -> &BTreeSet<Status> {
        &self.target
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Classify one observed status.
    pub fn classify(&self, status: &Status) -> Observation {
        if self.target.contains(status) {
            Observation::Target
        } else if self.pending.contains(status) {
            Observation::Pending
        } else if status.is_not_found() {
            Observation::NotFound
        } else {
            Observation::Unexpected
        }
    }

    fn expected(&self) -> Vec<Status> {
        self.target.iter().cloned().collect()
    }
}

/// How a single observed status relates to a [`WaitSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Target,
    Pending,
    /// Absent while absence is neither pending nor target.
    NotFound,
    Unexpected,
}

/// Successful outcome of a wait.
#[derive(Debug, Clone, PartialEq)]
pub struct Converged {
    pub status: Status,
    pub object: Option<RemoteObject>,
    pub polls: u32,
    pub elapsed: Duration,
}

/// Block until `id` reaches one of the target statuses in `spec`.
///
/// Probe errors end the wait immediately. Neither a failed nor a timed-out
/// wait is retried here.
pub async fn wait_for<P>(
    prober: &P,
    id: &ResourceId,
    spec: &WaitSpec,
    cancel: &CancellationToken,
) -> Result<Converged>
where
    P: StatusProber + ?Sized,
{
    let started = Instant::now();
    let deadline = deadline_after(started, spec.timeout);

    if !spec.delay.is_zero() {
        sleep_or_cancel(spec.delay, cancel).await?;
    }

    let mut polls: u32 = 0;
    let mut not_found: u32 = 0;
    let mut target_hits: u32 = 0;
    let mut last: Option<Probe> = None;

    loop {
        let probe = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConvergeError::Cancelled),
            probe = prober.probe(id) => probe?,
            _ = tokio::time::sleep_until(deadline) => {
                warn!(id = %id, timeout = ?spec.timeout, polls, "Timed out waiting for status read");
                return Err(timed_out(id, spec, last));
            }
        };
        polls += 1;

        match spec.classify(&probe.status) {
            Observation::Target => {
                not_found = 0;
                target_hits += 1;
                debug!(id = %id, status = %probe.status, polls, "Target status observed");
                if target_hits >= spec.continuous_target_occurrence {
                    return Ok(Converged {
                        status: probe.status,
                        object: probe.object,
                        polls,
                        elapsed: started.elapsed(),
                    });
                }
            }
            Observation::Pending => {
                not_found = 0;
                target_hits = 0;
                debug!(id = %id, status = %probe.status, polls, "Still pending");
            }
            Observation::NotFound => {
                target_hits = 0;
                not_found += 1;
                debug!(id = %id, checks = not_found, "Object not found yet");
                if not_found > spec.not_found_checks {
                    warn!(id = %id, checks = not_found, "Object never appeared");
                    return Err(ConvergeError::NotFound { id: id.clone() });
                }
            }
            Observation::Unexpected => {
                warn!(id = %id, status = %probe.status, "Unexpected status while waiting");
                let reason = probe.reason();
                return Err(ConvergeError::ConvergenceFailed {
                    id: id.clone(),
                    status: probe.status,
                    expected: spec.expected(),
                    reason,
                    object: probe.object.map(Box::new),
                });
            }
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(id = %id, status = %probe.status, timeout = ?spec.timeout, polls, "Timed out waiting for status");
            return Err(timed_out(id, spec, Some(probe)));
        }
        last = Some(probe);

        sleep_or_cancel(spec.poll_interval.min(deadline - now), cancel).await?;
    }
}

/// Timeout error from the last completed status read. Without one, the status is
/// the first pending status.
fn timed_out(id: &ResourceId, spec: &WaitSpec, last: Option<Probe>) -> ConvergeError {
    let (status, object) = match last {
        Some(probe) => (probe.status, probe.object),
        None => (
            spec.pending.iter().next().cloned().unwrap_or_else(|| Status::new("")),
            None,
        ),
    };
    ConvergeError::ConvergenceTimedOut {
        id: id.clone(),
        reason: object.as_ref().and_then(|o| o.status_message.clone()),
        status,
        expected: spec.expected(),
        timeout: spec.timeout,
        object: object.map(Box::new),
    }
}

/// `start + timeout`, saturating to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Sleep unless the token fires first.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ConvergeError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed sequence of probe results, repeating the last one.
    struct Scripted {
        steps: Mutex<VecDeque<std::result::Result<Probe, RemoteError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn statuses(statuses: &[&str]) -> Self {
            let steps = statuses
                .iter()
                .map(|s| {
                    if *s == "DoesNotExist" {
                        Ok(Probe::not_found())
                    } else {
                        Ok(Probe::found(RemoteObject::new("obj-1", "activation", *s)))
                    }
                })
                .collect();
            Self {
                steps: Mutex::new(steps),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl StatusProber for Scripted {
        async fn probe(&self, _id: &ResourceId) -> std::result::Result<Probe, RemoteError> {
            *self.calls.lock().unwrap() += 1;
            let mut steps = self.steps.lock().unwrap();
            if steps.len() > 1 {
                steps.pop_front().unwrap()
            } else {
                steps.front().cloned().unwrap()
            }
        }
    }

    fn spec(timeout_secs: u64) -> WaitSpec {
        WaitSpec::new(["Creating", "Updating"], ["Active"], Duration::from_secs(timeout_secs))
            .unwrap()
            .poll_interval(Duration::from_secs(1))
            .unwrap()
    }

    fn id() -> ResourceId {
        ResourceId::from("obj-1")
    }

    #[test]
    fn test_overlapping_states_rejected() {
        let err = WaitSpec::new(["Creating", "Active"], ["Active"], Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, ConfigError::OverlappingStates(Status::from("Active")));
    }

    #[test]
    fn test_empty_target_rejected() {
        let err = WaitSpec::new(["Creating"], Vec::<Status>::new(), Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, ConfigError::EmptyTarget);
    }

    #[test]
    fn test_classify() {
        let spec = spec(10);
        assert_eq!(spec.classify(&Status::from("Active")), Observation::Target);
        assert_eq!(spec.classify(&Status::from("Creating")), Observation::Pending);
        assert_eq!(spec.classify(&Status::not_found()), Observation::NotFound);
        assert_eq!(spec.classify(&Status::from("Failed")), Observation::Unexpected);

        let deleted = WaitSpec::deleted(["Deleting"], Duration::from_secs(1)).unwrap();
        assert_eq!(deleted.classify(&Status::not_found()), Observation::Target);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaches_target_after_pending_polls() {
        let prober = Scripted::statuses(&["Creating", "Creating", "Updating", "Active"]);
        let done = wait_for(&prober, &id(), &spec(60), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, Status::from("Active"));
        assert_eq!(done.polls, 4);
        assert_eq!(done.elapsed, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_on_first_probe_never_sleeps() {
        let prober = Scripted::statuses(&["Active"]);
        let done = wait_for(&prober, &id(), &spec(60), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.polls, 1);
        assert_eq!(done.elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_status_fails_with_object() {
        let prober = Scripted::statuses(&["Creating", "Failed"]);
        let err = wait_for(&prober, &id(), &spec(60), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ConvergeError::ConvergenceFailed {
                status, object, expected, ..
            } => {
                assert_eq!(status, Status::from("Failed"));
                assert_eq!(expected, vec![Status::from("Active")]);
                assert_eq!(object.unwrap().status, Status::from("Failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(prober.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_pending_times_out() {
        let prober = Scripted::statuses(&["Creating"]);
        let err = wait_for(&prober, &id(), &spec(5), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ConvergeError::ConvergenceTimedOut {
                status, timeout, ..
            } => {
                assert_eq!(status, Status::from("Creating"));
                assert_eq!(timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected error: {other}"),
        }
        // t=0..=5, one probe per second including the deadline.
        assert_eq!(prober.calls(), 6);
    }

    /// Answers the first `answers` reads with `Creating`, then never responds.
    struct Stalls {
        answers: u32,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl StatusProber for Stalls {
        async fn probe(&self, _id: &ResourceId) -> std::result::Result<Probe, RemoteError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call > self.answers {
                std::future::pending::<()>().await;
            }
            Ok(Probe::found(RemoteObject::new("obj-1", "activation", "Creating")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_status_read_times_out() {
        let prober = Stalls {
            answers: 0,
            calls: Mutex::new(0),
        };
        let started = Instant::now();
        let err = wait_for(&prober, &id(), &spec(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        match err {
            ConvergeError::ConvergenceTimedOut { status, object, .. } => {
                assert_eq!(status, Status::from("Creating"));
                assert!(object.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_read_reports_last_observation() {
        let prober = Stalls {
            answers: 2,
            calls: Mutex::new(0),
        };
        let started = Instant::now();
        let err = wait_for(&prober, &id(), &spec(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        match err {
            ConvergeError::ConvergenceTimedOut { status, object, .. } => {
                assert_eq!(status, Status::from("Creating"));
                assert_eq!(object.unwrap().id, id());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*prober.calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_does_not_overflow() {
        let prober = Scripted::statuses(&["Creating", "Active"]);
        let spec = WaitSpec::new(["Creating"], ["Active"], Duration::MAX)
            .unwrap()
            .poll_interval(Duration::from_secs(1))
            .unwrap();
        let done = wait_for(&prober, &id(), &spec, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after_saturates() {
        let start = Instant::now();
        assert_eq!(deadline_after(start, Duration::from_secs(3)), start + Duration::from_secs(3));
        assert!(deadline_after(start, Duration::MAX) > start + Duration::from_secs(86_400 * 365));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_wait_succeeds_on_not_found() {
        let prober = Scripted::statuses(&["Deleting", "Deleting", "DoesNotExist"]);
        let spec = WaitSpec::deleted(["Deleting"], Duration::from_secs(30))
            .unwrap()
            .poll_interval(Duration::from_secs(2))
            .unwrap();
        let done = wait_for(&prober, &id(), &spec, &CancellationToken::new())
            .await
            .unwrap();
        assert!(done.status.is_not_found());
        assert!(done.object.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_tolerated_then_found() {
        let prober = Scripted::statuses(&["DoesNotExist", "DoesNotExist", "Creating", "Active"]);
        let done = wait_for(&prober, &id(), &spec(60), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, Status::from("Active"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_checks_exhausted() {
        let prober = Scripted::statuses(&["DoesNotExist"]);
        let spec = spec(600).not_found_checks(3);
        let err = wait_for(&prober, &id(), &spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(prober.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_target_occurrence() {
        let prober = Scripted::statuses(&["Active", "Updating", "Active", "Active"]);
        let spec = spec(60).continuous_target_occurrence(2).unwrap();
        let done = wait_for(&prober, &id(), &spec, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay() {
        let prober = Scripted::statuses(&["Active"]);
        let spec = spec(60).delay(Duration::from_secs(10));
        let done = wait_for(&prober, &id(), &spec, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.elapsed, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_ends_wait() {
        let prober = Scripted {
            steps: Mutex::new(VecDeque::from([Err(RemoteError::api(
                "AccessDeniedException",
                "denied",
            ))])),
            calls: Mutex::new(0),
        };
        let err = wait_for(&prober, &id(), &spec(60), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::Remote(RemoteError::Api { .. })));
        assert_eq!(prober.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_wait() {
        let prober = Scripted::statuses(&["Creating"]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = wait_for(&prober, &id(), &spec(600), &cancel).await.unwrap_err();
        assert!(matches!(err, ConvergeError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
