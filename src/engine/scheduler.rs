//! Runs the probe units of one target under the per-target concurrency limit.
//!
//! Each unit moves `Pending -> Running -> terminal`, passing through
//! `Retrying -> Running` while transient failures remain and the retry budget
//! lasts. A stop request keeps pending units from starting; units already
//! running get `cancel_grace` to finish before they are aborted.

use crate::error::{ConnectError, ScanError};
use crate::model::{
    AttemptRecord, InconclusiveReason, ProbeOutcome, ProbeRecord, ScanConfig, UnitState,
};
use crate::net::Connector;
use crate::probe::{Probe, ProbeContext};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

pub(crate) struct Scheduler {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) config: ScanConfig,
    /// Global stop request.
    pub(crate) stop: CancellationToken,
}

/// One probe bound to one target, with its attempt history.
struct Unit {
    probe: Arc<dyn Probe>,
    state: UnitState,
    attempts: Vec<AttemptRecord>,
}

impl Unit {
    fn new(probe: Arc<dyn Probe>) -> Self {
        Self {
            probe,
            state: UnitState::Pending,
            attempts: Vec::new(),
        }
    }

    fn transition(&mut self, next: UnitState) {
        let legal = next.is_terminal()
            || matches!(
                (self.state, next),
                (UnitState::Pending, UnitState::Running)
                    | (UnitState::Running, UnitState::Retrying)
                    | (UnitState::Retrying, UnitState::Running)
            );
        debug_assert!(legal, "illegal transition {:?} -> {:?}", self.state, next);
        trace!(probe = %self.probe.spec().id, from = ?self.state, to = ?next, "unit state");
        self.state = next;
    }

    fn finish(self) -> ProbeRecord {
        let spec = self.probe.spec();
        let record = ProbeRecord::from_attempts(spec.id.clone(), spec.category, self.attempts);
        trace!(probe = %spec.id, from = ?self.state, to = ?record.state, "unit finished");
        record
    }
}

impl Scheduler {
    /// Run every probe against `target`. Returns one record per probe, in no
    /// particular order.
    #[instrument(skip_all, fields(target = %ctx.target))]
    pub(crate) async fn run_target(
        &self,
        probes: &[Arc<dyn Probe>],
        mut ctx: ProbeContext,
    ) -> Result<Vec<ProbeRecord>, ScanError> {
        let abort = CancellationToken::new();
        ctx.cancel = abort.clone();
        let watcher = tokio::spawn(escalate(
            self.stop.clone(),
            abort.clone(),
            self.config.cancel_grace,
        ));

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_per_target));
        let mut tasks = FuturesUnordered::new();
        for probe in probes {
            let unit = Unit::new(probe.clone());
            let runner = UnitRunner {
                connector: self.connector.clone(),
                config: self.config.clone(),
                stop: self.stop.clone(),
                abort: abort.clone(),
                ctx: ctx.clone(),
            };
            let permits = permits.clone();
            let id = probe.spec().id.clone();
            let category = probe.spec().category;
            let handle = tokio::spawn(async move { runner.drive(unit, permits).await });
            tasks.push(async move {
                match handle.await {
                    Ok(result) => result,
                    Err(err) => {
                        // The unit task itself died outside the probe body.
                        warn!(probe = %id, %err, "probe task failed");
                        Ok(ProbeRecord::from_attempts(
                            id,
                            category,
                            vec![AttemptRecord {
                                attempt: 1,
                                outcome: ProbeOutcome::Inconclusive(
                                    InconclusiveReason::ProbeFault(err.to_string()),
                                ),
                                elapsed_ms: 0,
                            }],
                        ))
                    }
                }
            });
        }

        let mut records = Vec::with_capacity(probes.len());
        let mut failure = None;
        while let Some(result) = tasks.next().await {
            match result {
                Ok(record) => records.push(record),
                Err(err) => {
                    // Scan-level failure: stop the remaining units right away.
                    abort.cancel();
                    failure.get_or_insert(err);
                }
            }
        }
        watcher.abort();

        match failure {
            Some(err) => Err(err),
            None => Ok(records),
        }
    }
}

/// Once `stop` fires, give in-flight work `grace` before aborting it.
async fn escalate(stop: CancellationToken, abort: CancellationToken, grace: Duration) {
    stop.cancelled().await;
    debug!(?grace, "stop requested; draining in-flight probes");
    sleep(grace).await;
    abort.cancel();
}

struct UnitRunner {
    connector: Arc<dyn Connector>,
    config: ScanConfig,
    stop: CancellationToken,
    abort: CancellationToken,
    ctx: ProbeContext,
}

impl UnitRunner {
    async fn drive(
        self,
        mut unit: Unit,
        permits: Arc<Semaphore>,
    ) -> Result<ProbeRecord, ScanError> {
        let _permit = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Ok(unit.finish()),
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(unit.finish()),
            },
        };
        if self.stop.is_cancelled() {
            return Ok(unit.finish());
        }

        let limit = unit
            .probe
            .spec()
            .timeout
            .unwrap_or(self.config.per_probe_timeout);
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 0u32;
        unit.transition(UnitState::Running);

        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = self.abort.cancelled() => {
                    ProbeOutcome::Inconclusive(InconclusiveReason::Cancelled)
                }
                result = timeout(limit, self.attempt(&unit.probe)) => {
                    result.unwrap_or(ProbeOutcome::Timeout)
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            if let ProbeOutcome::ConnectionError(ConnectError::ResourceExhausted(reason)) = &outcome
            {
                return Err(ScanError::ResourceExhausted {
                    target: self.ctx.target.to_string(),
                    reason: reason.clone(),
                });
            }

            debug!(probe = %unit.probe.spec().id, attempt, elapsed_ms, ?outcome, "attempt finished");
            let retry = outcome.is_retryable() && attempt < max_attempts;
            unit.attempts.push(AttemptRecord {
                attempt,
                outcome,
                elapsed_ms,
            });
            if !retry || self.stop.is_cancelled() {
                break;
            }

            unit.transition(UnitState::Retrying);
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = sleep(self.config.retry_backoff) => {}
            }
            unit.transition(UnitState::Running);
        }

        Ok(unit.finish())
    }

    async fn attempt(&self, probe: &Arc<dyn Probe>) -> ProbeOutcome {
        let conn = match self.connector.open(&self.ctx.target, &self.abort).await {
            Ok(conn) => conn,
            Err(ConnectError::TcpTimeout(_)) => return ProbeOutcome::Timeout,
            Err(ConnectError::Cancelled) => {
                return ProbeOutcome::Inconclusive(InconclusiveReason::Cancelled)
            }
            Err(err) => return ProbeOutcome::ConnectionError(err),
        };

        match AssertUnwindSafe(probe.run(conn, &self.ctx))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(probe = %probe.spec().id, %message, "probe panicked");
                ProbeOutcome::Inconclusive(InconclusiveReason::ProbeFault(message))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "probe panicked".to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::certificate::CertificateValidator;
    use crate::model::Target;
    use crate::tls::HandshakeAdapter;
    use std::sync::atomic::Ordering;

    fn config() -> ScanConfig {
        ScanConfig {
            max_concurrent_per_target: 2,
            per_probe_timeout: Duration::from_secs(1),
            max_retries: 2,
            retry_backoff: Duration::from_millis(10),
            cancel_grace: Duration::from_millis(100),
            ..ScanConfig::default()
        }
    }

    fn scheduler(connector: Arc<dyn Connector>, config: ScanConfig) -> Scheduler {
        Scheduler {
            connector,
            config,
            stop: CancellationToken::new(),
        }
    }

    fn context() -> ProbeContext {
        ProbeContext {
            target: Arc::new(Target::new("example.com", 443)),
            adapter: HandshakeAdapter::new(Duration::from_secs(1)),
            trust_stores: Arc::new(Vec::new()),
            validator: CertificateValidator::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn record<'a>(records: &'a [ProbeRecord], id: &str) -> &'a ProbeRecord {
        records
            .iter()
            .find(|r| r.probe.as_str() == id)
            .unwrap_or_else(|| panic!("no record for {id}"))
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_up_to_the_cap() {
        let probe = Arc::new(ScriptedProbe::new("t", vec![Step::Timeout]));
        let sched = scheduler(Arc::new(NullConnector), config());
        let records = sched.run_target(&[probe.clone() as Arc<dyn Probe>], context()).await.unwrap();

        let rec = record(&records, "t");
        assert_eq!(rec.state, UnitState::TimedOut);
        assert_eq!(rec.attempts.len(), 3);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_timeout_wins() {
        let probe = Arc::new(ScriptedProbe::new("t", vec![Step::Timeout, Step::Succeed]));
        let sched = scheduler(Arc::new(NullConnector), config());
        let records = sched.run_target(&[probe as Arc<dyn Probe>], context()).await.unwrap();

        let rec = record(&records, "t");
        assert_eq!(rec.state, UnitState::Succeeded);
        assert_eq!(rec.attempts.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejections_are_never_retried() {
        let probe = Arc::new(ScriptedProbe::new("r", vec![Step::Reject]));
        let sched = scheduler(Arc::new(NullConnector), config());
        let records = sched.run_target(&[probe.clone() as Arc<dyn Probe>], context()).await.unwrap();

        assert_eq!(record(&records, "r").state, UnitState::Rejected);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_probe_times_out_by_one_tick() {
        let limit = Duration::from_secs(1);
        let over = Arc::new(ScriptedProbe::new(
            "over",
            vec![Step::Sleep(limit + Duration::from_millis(1))],
        ));
        let under = Arc::new(ScriptedProbe::new(
            "under",
            vec![Step::Sleep(limit - Duration::from_millis(1))],
        ));
        let sched = scheduler(
            Arc::new(NullConnector),
            ScanConfig {
                max_retries: 0,
                ..config()
            },
        );
        let records = sched.run_target(&[over as Arc<dyn Probe>, under], context()).await.unwrap();

        assert_eq!(record(&records, "over").state, UnitState::TimedOut);
        assert_eq!(record(&records, "under").state, UnitState::Succeeded);
    }

    #[tokio::test]
    async fn panicking_probe_is_isolated() {
        let bad = Arc::new(ScriptedProbe::new("bad", vec![Step::Panic]));
        let good = Arc::new(ScriptedProbe::new("good", vec![Step::Succeed]));
        let sched = scheduler(Arc::new(NullConnector), config());
        let records = sched.run_target(&[bad as Arc<dyn Probe>, good], context()).await.unwrap();

        match &record(&records, "bad").outcome {
            ProbeOutcome::Inconclusive(InconclusiveReason::ProbeFault(message)) => {
                assert!(message.contains("scripted failure"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(record(&records, "good").state, UnitState::Succeeded);
    }

    #[tokio::test]
    async fn resource_exhaustion_aborts_the_target() {
        let probe = Arc::new(ScriptedProbe::new("p", vec![Step::Succeed]));
        let connector = FailingConnector(ConnectError::ResourceExhausted("EMFILE".into()));
        let sched = scheduler(Arc::new(connector), config());

        assert!(matches!(
            sched.run_target(&[probe as Arc<dyn Probe>], context()).await,
            Err(ScanError::ResourceExhausted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connections_are_retried_then_errored() {
        let probe = Arc::new(ScriptedProbe::new("p", vec![Step::Succeed]));
        let connector = FailingConnector(ConnectError::TcpRefused("refused".into()));
        let sched = scheduler(Arc::new(connector), config());
        let records = sched.run_target(&[probe.clone() as Arc<dyn Probe>], context()).await.unwrap();

        let rec = record(&records, "p");
        assert_eq!(rec.state, UnitState::Errored);
        assert_eq!(rec.attempts.len(), 3);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_and_aborts_stragglers_after_grace() {
        let hung = Arc::new(ScriptedProbe::new("hung", vec![Step::Hang]));
        let quick = Arc::new(ScriptedProbe::new("quick", vec![Step::Succeed]));
        let queued = Arc::new(ScriptedProbe::new("queued", vec![Step::Succeed]));
        let sched = scheduler(
            Arc::new(NullConnector),
            ScanConfig {
                max_concurrent_per_target: 1,
                per_probe_timeout: Duration::from_secs(7200),
                ..config()
            },
        );
        let stop = sched.stop.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            stop.cancel();
        });

        let probes: Vec<Arc<dyn Probe>> = vec![quick, hung, queued];
        let started = Instant::now();
        let records = sched.run_target(&probes, context()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(record(&records, "quick").state, UnitState::Succeeded);
        assert_eq!(
            record(&records, "hung").outcome,
            ProbeOutcome::Inconclusive(InconclusiveReason::Cancelled)
        );
        assert_eq!(
            record(&records, "queued").outcome,
            ProbeOutcome::Inconclusive(InconclusiveReason::Cancelled)
        );
        assert!(record(&records, "queued").attempts.is_empty());
    }
}
