//! Probes: self-contained units that each open one connection, perform one
//! exchange and interpret it.
//!
//! A probe never retries and never fails the scan. Everything it learns,
//! including failure, is expressed as a [`ProbeOutcome`].

pub mod certificate;
pub mod cipher;
pub mod extension;
pub mod registry;
pub mod vulnerability;

pub use registry::ProbeRegistry;

use crate::certificate::{CertificateValidator, TrustStore};
use crate::error::ConnectError;
use crate::model::{
    InconclusiveReason, ProbeCategory, ProbeId, ProbeOutcome, RejectReason, Target,
};
use crate::net::Connection;
use crate::tls::{HandshakeAdapter, HandshakeResponse, ServerFlight};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How far a probe has to take the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    ServerHello,
    FullHandshake,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub id: ProbeId,
    pub category: ProbeCategory,
    pub requirement: Requirement,
    /// Overrides the scanner's per-probe timeout when set.
    pub timeout: Option<Duration>,
}

impl ProbeSpec {
    pub fn new(id: impl Into<String>, category: ProbeCategory, requirement: Requirement) -> Self {
        Self {
            id: ProbeId::new(id),
            category,
            requirement,
            timeout: None,
        }
    }
}

/// Shared, read-only inputs available to every probe of one target.
#[derive(Clone)]
pub struct ProbeContext {
    pub target: Arc<Target>,
    pub adapter: HandshakeAdapter,
    pub trust_stores: Arc<Vec<TrustStore>>,
    pub validator: CertificateValidator,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn spec(&self) -> &ProbeSpec;

    /// Consume one fresh connection and report what happened.
    async fn run(&self, conn: Connection, ctx: &ProbeContext) -> ProbeOutcome;
}

/// Turn anything but an accepted hello into the probe outcome it implies.
pub(crate) fn settle(response: HandshakeResponse) -> Result<ServerFlight, ProbeOutcome> {
    match response {
        HandshakeResponse::Accepted(flight) => Ok(flight),
        HandshakeResponse::Alert { alert, .. } => {
            Err(ProbeOutcome::Rejected(RejectReason::Alert(alert)))
        }
        HandshakeResponse::Ssl2Error(code) => {
            Err(ProbeOutcome::Rejected(RejectReason::Ssl2Error(code)))
        }
        HandshakeResponse::ConnectionClosed => {
            Err(ProbeOutcome::Rejected(RejectReason::ConnectionClosed))
        }
        HandshakeResponse::Malformed(detail) => {
            Err(ProbeOutcome::Rejected(RejectReason::Malformed(detail)))
        }
        HandshakeResponse::Unencodable(detail) => Err(ProbeOutcome::Inconclusive(
            InconclusiveReason::Internal(detail),
        )),
        HandshakeResponse::NoResponse => Err(ProbeOutcome::Timeout),
        HandshakeResponse::Io(detail) => Err(ProbeOutcome::ConnectionError(ConnectError::Network(
            detail,
        ))),
        HandshakeResponse::Cancelled => Err(ProbeOutcome::Inconclusive(
            InconclusiveReason::Cancelled,
        )),
    }
}
