pub mod aggregate;
pub mod rate;
mod scheduler;

pub use aggregate::aggregate;

use crate::certificate::{CertificateValidator, TrustStore};
use crate::error::ScanError;
use crate::model::{ScanConfig, ScanReport, StartTlsProtocol, Target};
use crate::net::{Connector, TcpConnector};
use crate::probe::{Probe, ProbeContext};
use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use scheduler::Scheduler;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Entry point of the library: owns the limits, the connection factory and
/// the trust stores shared by every scan it runs.
pub struct Scanner {
    connector: Arc<dyn Connector>,
    config: ScanConfig,
    trust_stores: Arc<Vec<TrustStore>>,
    validator: CertificateValidator,
    stop: CancellationToken,
    targets: Arc<Semaphore>,
    in_flight: Arc<Mutex<BTreeSet<TargetKey>>>,
}

type TargetKey = (String, u16, Option<StartTlsProtocol>);

/// Holds a target key in the scanner's in-flight set until dropped.
struct InFlight {
    keys: Arc<Mutex<BTreeSet<TargetKey>>>,
    key: TargetKey,
}

impl InFlight {
    fn claim(keys: &Arc<Mutex<BTreeSet<TargetKey>>>, target: &Target) -> Option<Self> {
        let key = target.key();
        let mut set = keys.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(key.clone()) {
            return None;
        }
        Some(Self {
            keys: keys.clone(),
            key,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Result<Self, ScanError> {
        config.validate()?;
        Ok(Self {
            connector: Arc::new(TcpConnector::new(&config)),
            targets: Arc::new(Semaphore::new(config.max_concurrent_targets)),
            trust_stores: Arc::new(Vec::new()),
            validator: CertificateValidator::new(),
            stop: CancellationToken::new(),
            in_flight: Arc::new(Mutex::new(BTreeSet::new())),
            config,
        })
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_trust_stores(mut self, stores: Vec<TrustStore>) -> Self {
        self.trust_stores = Arc::new(stores);
        self
    }

    pub fn with_validator(mut self, validator: CertificateValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Cancelling the returned token stops every scan of this scanner: queued
    /// probes are skipped and running ones get `cancel_grace` to finish.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    #[instrument(skip(self, probes), fields(probes = probes.len()))]
    pub async fn scan(
        &self,
        target: Target,
        probes: &[Arc<dyn Probe>],
    ) -> Result<ScanReport, ScanError> {
        let mut seen = BTreeSet::new();
        for probe in probes {
            if !seen.insert(&probe.spec().id) {
                return Err(ScanError::DuplicateProbe {
                    target: target.to_string(),
                    probe: probe.spec().id.to_string(),
                });
            }
        }

        // Two concurrent scans of one server would double the load on it.
        let _claim = InFlight::claim(&self.in_flight, &target)
            .ok_or_else(|| ScanError::DuplicateTarget(target.to_string()))?;

        let _permit = self
            .targets
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScanError::InvalidConfig("target limiter closed".into()))?;

        let target = Arc::new(target);
        let ctx = ProbeContext {
            target: target.clone(),
            adapter: crate::tls::HandshakeAdapter::new(self.config.read_timeout),
            trust_stores: self.trust_stores.clone(),
            validator: self.validator.clone(),
            cancel: self.stop.clone(),
        };
        let scheduler = Scheduler {
            connector: self.connector.clone(),
            config: self.config.clone(),
            stop: self.stop.clone(),
        };

        let records = scheduler.run_target(probes, ctx).await?;
        let mut report = aggregate(&target, records);
        report.finished_at = Some(Utc::now());
        info!(
            complete = report.is_complete(),
            accepted = report.accepted_suites.len(),
            "target scanned"
        );
        Ok(report)
    }

    /// Scan several targets concurrently and return their results in request
    /// order.
    pub async fn scan_many(
        &self,
        targets: Vec<Target>,
        probes: &[Arc<dyn Probe>],
    ) -> Result<Vec<Result<ScanReport, ScanError>>, ScanError> {
        reject_duplicates(&targets)?;

        let mut tasks: FuturesUnordered<_> = targets
            .into_iter()
            .enumerate()
            .map(|(index, target)| async move { (index, self.scan(target, probes).await) })
            .collect();

        let mut results: Vec<Option<Result<ScanReport, ScanError>>> =
            std::iter::repeat_with(|| None).take(tasks.len()).collect();
        while let Some((index, result)) = tasks.next().await {
            results[index] = Some(result);
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Scan targets in the background and yield each result as soon as its
    /// target completes.
    pub fn scan_stream(
        self: Arc<Self>,
        targets: Vec<Target>,
        probes: Vec<Arc<dyn Probe>>,
    ) -> Result<ReceiverStream<(Target, Result<ScanReport, ScanError>)>, ScanError> {
        reject_duplicates(&targets)?;
        let (tx, rx) = mpsc::channel(self.config.max_concurrent_targets.max(1));
        let probes: Arc<[Arc<dyn Probe>]> = probes.into();

        tokio::spawn(async move {
            let mut tasks = FuturesUnordered::new();
            for target in targets {
                let scanner = self.clone();
                let probes = probes.clone();
                let tx = tx.clone();
                tasks.push(tokio::spawn(async move {
                    let result = scanner.scan(target.clone(), &probes).await;
                    if let Err(err) = &result {
                        warn!(%target, %err, "scan failed");
                    }
                    if tx.send((target, result)).await.is_err() {
                        debug!("report receiver dropped");
                    }
                }));
            }
            while tasks.next().await.is_some() {}
        });

        Ok(ReceiverStream::new(rx))
    }
}

fn reject_duplicates(targets: &[Target]) -> Result<(), ScanError> {
    let mut seen = BTreeSet::new();
    for target in targets {
        if !seen.insert(target.key()) {
            return Err(ScanError::DuplicateTarget(target.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::scheduler::testing::{NullConnector, ScriptedProbe, Step};
    use super::*;
    use std::time::Duration;

    fn scanner() -> Scanner {
        Scanner::new(ScanConfig::default())
            .unwrap()
            .with_connector(Arc::new(NullConnector))
    }

    fn probes() -> Vec<Arc<dyn Probe>> {
        vec![
            Arc::new(ScriptedProbe::new("a", vec![Step::Succeed])),
            Arc::new(ScriptedProbe::new("b", vec![Step::Reject])),
        ]
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = ScanConfig {
            max_concurrent_targets: 0,
            ..ScanConfig::default()
        };
        assert!(matches!(
            Scanner::new(config),
            Err(ScanError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_probe_is_refused() {
        let probe: Arc<dyn Probe> = Arc::new(ScriptedProbe::new("a", vec![Step::Succeed]));
        let err = scanner()
            .scan(Target::new("example.com", 443), &[probe.clone(), probe])
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::DuplicateProbe { .. }));
    }

    #[tokio::test]
    async fn duplicate_target_is_refused() {
        let targets = vec![
            Target::new("Example.com", 443),
            Target::new("example.com", 443),
        ];
        assert!(matches!(
            scanner().scan_many(targets, &probes()).await,
            Err(ScanError::DuplicateTarget(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_scan_of_busy_target_is_refused() {
        let scanner = Arc::new(scanner());
        let slow: Vec<Arc<dyn Probe>> = vec![Arc::new(ScriptedProbe::new(
            "slow",
            vec![Step::Sleep(Duration::from_millis(200))],
        ))];

        let first = tokio::spawn({
            let scanner = scanner.clone();
            let slow = slow.clone();
            async move { scanner.scan(Target::new("example.com", 443), &slow).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = scanner.scan(Target::new("EXAMPLE.com", 443), &probes()).await;
        assert!(matches!(second, Err(ScanError::DuplicateTarget(_))));
        assert!(first.await.unwrap().is_ok());

        // The key is released once the first scan is over.
        let again = scanner.scan(Target::new("example.com", 443), &probes()).await;
        assert!(again.is_ok_and(|r| r.is_complete()));
    }

    #[tokio::test]
    async fn same_host_with_other_starttls_is_distinct() {
        let targets = vec![
            Target::new("mail.example.com", 25),
            Target::new("mail.example.com", 25).with_starttls(StartTlsProtocol::Smtp),
        ];
        let results = scanner().scan_many(targets, &probes()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|r| r.is_complete())));
    }

    #[tokio::test]
    async fn scan_many_keeps_request_order() {
        let targets: Vec<Target> = (1..=4).map(|n| Target::new(format!("host{n}"), 443)).collect();
        let results = scanner().scan_many(targets, &probes()).await.unwrap();
        let hosts: Vec<String> = results
            .into_iter()
            .map(|r| r.unwrap().target.host)
            .collect();
        assert_eq!(hosts, vec!["host1", "host2", "host3", "host4"]);
    }

    #[tokio::test]
    async fn stream_yields_every_target() {
        let scanner = Arc::new(scanner());
        let targets: Vec<Target> = (1..=3).map(|n| Target::new(format!("host{n}"), 443)).collect();
        let stream = scanner.scan_stream(targets, probes()).unwrap();
        let results: Vec<_> = stream.collect().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }
}
