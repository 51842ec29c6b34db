//! Folds probe records into a [`ScanReport`].
//!
//! The fold is pure and independent of the order in which records arrive:
//! every collection it produces is keyed or sorted.

use crate::model::{
    AcceptedSuite, Conflict, Gap, GapReason, InconclusiveReason, ProbeId, ProbeOutcome,
    ProbePayload, ProbeRecord, ScanReport, ScanStatus, Target, Verdict, VersionSupport,
};
use crate::tls::{ciphers, ProtocolVersion};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Two records for one probe become one: their attempts are pooled in a
/// fixed order and the terminal outcome is chosen again.
fn merge(first: ProbeRecord, second: ProbeRecord) -> ProbeRecord {
    debug!(probe = %first.probe, "merging duplicate probe records");
    let mut attempts = first.attempts;
    attempts.extend(second.attempts);
    attempts.sort_by_cached_key(|a| (a.attempt, a.elapsed_ms, format!("{:?}", a.outcome)));
    ProbeRecord::from_attempts(first.probe, first.category, attempts)
}

pub fn aggregate(target: &Target, records: Vec<ProbeRecord>) -> ScanReport {
    let mut probes: BTreeMap<ProbeId, ProbeRecord> = BTreeMap::new();
    for record in records {
        let record = match probes.remove(&record.probe) {
            Some(existing) => merge(existing, record),
            None => record,
        };
        probes.insert(record.probe.clone(), record);
    }

    let mut accepted_suites = BTreeSet::new();
    let mut extensions = BTreeMap::new();
    let mut vulnerabilities = BTreeMap::new();
    let mut certificate = None;
    let mut gaps = Vec::new();

    for record in probes.values() {
        match &record.outcome {
            ProbeOutcome::Success(ProbePayload::CipherAccepted(suite)) => {
                accepted_suites.insert(suite.clone());
            }
            ProbeOutcome::Success(ProbePayload::Extension(finding)) => {
                extensions.insert(finding.name.clone(), finding.clone());
            }
            ProbeOutcome::Success(ProbePayload::Vulnerability(finding)) => {
                vulnerabilities.insert(finding.policy.clone(), finding.clone());
            }
            ProbeOutcome::Success(ProbePayload::Certificate(findings)) => {
                certificate = Some((**findings).clone());
            }
            ProbeOutcome::Rejected(_) => {}
            other => {
                if let Some(reason) = gap_reason(other) {
                    gaps.push(Gap {
                        probe: record.probe.clone(),
                        reason,
                    });
                }
            }
        }
    }

    let weak_suites = accepted_suites
        .iter()
        .filter(|s| is_weak(s))
        .map(|s| s.cipher.clone())
        .collect();
    let protocol_support = protocol_support(&probes);
    let conflicts = conflicts(&probes, &accepted_suites);

    ScanReport {
        target: target.view(),
        status: if gaps.is_empty() {
            ScanStatus::Complete
        } else {
            ScanStatus::Partial { gaps }
        },
        protocol_support,
        accepted_suites,
        weak_suites,
        extensions,
        vulnerabilities,
        certificate,
        probes,
        conflicts,
        finished_at: None,
    }
}

fn gap_reason(outcome: &ProbeOutcome) -> Option<GapReason> {
    match outcome {
        ProbeOutcome::Success(_) | ProbeOutcome::Rejected(_) => None,
        ProbeOutcome::Timeout => Some(GapReason::TimedOut),
        ProbeOutcome::ConnectionError(_) => Some(GapReason::Unreachable),
        ProbeOutcome::Inconclusive(InconclusiveReason::Cancelled) => Some(GapReason::Cancelled),
        ProbeOutcome::Inconclusive(InconclusiveReason::ProbeFault(_)) => Some(GapReason::Faulted),
        ProbeOutcome::Inconclusive(_) => Some(GapReason::Undecided),
    }
}

fn is_weak(suite: &AcceptedSuite) -> bool {
    if suite.version == ProtocolVersion::Ssl2 {
        return true;
    }
    u16::try_from(suite.cipher_id)
        .ok()
        .and_then(ciphers::by_id)
        .map(|s| s.is_weak())
        .unwrap_or(false)
}

/// The protocol version a capability probe targets, read from its identifier
/// (`cipher/<version>/<suite>`).
fn capability_version(id: &ProbeId) -> Option<ProtocolVersion> {
    let mut parts = id.as_str().splitn(3, '/');
    match (parts.next(), parts.next()) {
        (Some("cipher"), Some(label)) => ProtocolVersion::from_label(label),
        _ => None,
    }
}

fn protocol_support(
    probes: &BTreeMap<ProbeId, ProbeRecord>,
) -> BTreeMap<ProtocolVersion, VersionSupport> {
    let mut outcomes: BTreeMap<ProtocolVersion, Vec<&ProbeOutcome>> = BTreeMap::new();
    for record in probes.values() {
        if let Some(version) = capability_version(&record.probe) {
            outcomes.entry(version).or_default().push(&record.outcome);
        }
    }
    outcomes
        .into_iter()
        .map(|(version, outcomes)| {
            let support = if outcomes
                .iter()
                .any(|o| matches!(o, ProbeOutcome::Success(ProbePayload::CipherAccepted(_))))
            {
                VersionSupport::Accepted
            } else if outcomes
                .iter()
                .all(|o| matches!(o, ProbeOutcome::Rejected(_)))
            {
                VersionSupport::Rejected
            } else {
                VersionSupport::Undetermined
            };
            (version, support)
        })
        .collect()
}

fn conflicts(
    probes: &BTreeMap<ProbeId, ProbeRecord>,
    accepted: &BTreeSet<AcceptedSuite>,
) -> Vec<Conflict> {
    let mut found = Vec::new();
    let certificate = probes.values().find_map(|record| match &record.outcome {
        ProbeOutcome::Success(ProbePayload::Certificate(findings)) => Some((record, findings)),
        _ => None,
    });

    if let Some((cert_record, findings)) = certificate {
        if let Some(version) = findings.negotiated_version {
            let rejected: Vec<&ProbeRecord> = probes
                .values()
                .filter(|r| capability_version(&r.probe) == Some(version))
                .collect();
            let all_rejected = !rejected.is_empty()
                && rejected
                    .iter()
                    .all(|r| matches!(r.outcome, ProbeOutcome::Rejected(_)));
            if all_rejected {
                let mut outcomes = BTreeMap::new();
                outcomes.insert(cert_record.probe.clone(), cert_record.outcome.clone());
                for r in rejected {
                    outcomes.insert(r.probe.clone(), r.outcome.clone());
                }
                found.push(Conflict {
                    subject: version.label().to_string(),
                    description: format!(
                        "full handshake negotiated {version} but every {version} capability probe was rejected"
                    ),
                    outcomes,
                });
            }

            if let Some(cipher) = &findings.negotiated_cipher {
                let id = ProbeId::new(format!("cipher/{}/{}", version.label(), cipher));
                if let Some(r) = probes.get(&id) {
                    if matches!(r.outcome, ProbeOutcome::Rejected(_)) {
                        let mut outcomes = BTreeMap::new();
                        outcomes.insert(cert_record.probe.clone(), cert_record.outcome.clone());
                        outcomes.insert(r.probe.clone(), r.outcome.clone());
                        found.push(Conflict {
                            subject: cipher.clone(),
                            description: format!(
                                "full handshake negotiated {cipher} which its capability probe saw rejected"
                            ),
                            outcomes,
                        });
                    }
                }
            }
        }
    }

    let fallback = probes.values().find(|r| {
        matches!(
            &r.outcome,
            ProbeOutcome::Success(ProbePayload::Vulnerability(f))
                if f.policy == "fallback_scsv" && f.verdict == Verdict::Vulnerable
        )
    });
    if let Some(fallback) = fallback {
        let newer: Vec<&ProbeRecord> = probes
            .values()
            .filter(|r| capability_version(&r.probe).is_some_and(|v| v > ProtocolVersion::Tls11))
            .collect();
        let newer_accepted = accepted.iter().any(|s| s.version > ProtocolVersion::Tls11);
        if !newer.is_empty() && !newer_accepted {
            let mut outcomes = BTreeMap::new();
            outcomes.insert(fallback.probe.clone(), fallback.outcome.clone());
            found.push(Conflict {
                subject: "fallback_scsv".into(),
                description: "downgrade accepted although no version above TLS1.1 was accepted"
                    .into(),
                outcomes,
            });
        }
    }

    found
}
