
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::Serialize;
use slotmap::new_key_type;
use stun::agent::TransactionId;

use crate::control::Role;
use crate::error::{Error, Result};

/// The component id carrying RTP.
pub const COMPONENT_RTP: u16 = 1;
/// The component id carrying RTCP.
pub const COMPONENT_RTCP: u16 = 2;

pub(crate) const MIN_COMPONENT_ID: u16 = 1;
pub(crate) const MAX_COMPONENT_ID: u16 = 256;

/// The local preference recommended for hosts with a single IP address.
pub const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// Initial retransmission timeout for an in-flight connectivity check.
pub(crate) const DEFAULT_RTO: Duration = Duration::from_millis(100);

/// A check is abandoned after this many retransmissions of its request.
pub(crate) const MAX_RETRANSMISSIONS: u32 = 7;

new_key_type!(
    /// Handle to a candidate in the local candidate arena of a check list.
    pub struct LocalCandidateId;
    /// Handle to a candidate in the remote candidate arena of a check list.
    pub struct RemoteCandidateId;
    /// Handle to a candidate pair in the pair pool of a check list.
    pub struct PairId;
);

/// A transport address as carried in candidate lines: an IP literal (or host
/// name) and a port.
///
/// Equality is textual on the address part, so `"10.0.0.1"` and a host name
/// resolving to it are distinct candidates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TransportAddress {
    pub ip: String,
    pub port: u16,
}

impl TransportAddress {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Resolves the address for transmission, accepting plain IP literals as
    /// well as resolvable host names.
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        if let Ok(ip) = IpAddr::from_str(&self.ip) {
            return Ok(SocketAddr::new(ip, self.port));
        }
        (self.ip.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| Error::ErrAddressParseFailed)?
            .next()
            .ok_or(Error::ErrAddressParseFailed)
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<SocketAddr> for TransportAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Represents the type of candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidateType {
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for CandidateType {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            _ => Err(Error::ErrUnknownCandidateType),
        }
    }
}

impl CandidateType {
    /// Returns the preference weight of a `CandidateType`.
    ///
    /// 4.1.2.2.  Guidelines for Choosing Type and Local Preferences
    /// The RECOMMENDED values are 126 for host candidates, 100
    /// for server reflexive candidates, 110 for peer reflexive candidates,
    /// and 0 for relayed candidates.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

/// A transport address at which an agent can receive packets, together with
/// the attributes ICE attaches to it.
///
/// Local candidates reference their base through the local candidate arena;
/// remote candidates carry no base.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub kind: CandidateType,
    pub component_id: u16,
    pub addr: TransportAddress,
    pub priority: u32,
    pub local_preference: u16,
    pub foundation: String,
    pub base: Option<LocalCandidateId>,
    pub is_default: bool,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.addr)
    }
}

/// Represent the ICE candidate pair state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidatePairState {
    /// Means a check has not been performed for this pair, and the pair is
    /// cleared to run one.
    #[serde(rename = "waiting")]
    Waiting,

    /// Means a check has been sent for this pair, but the transaction is in
    /// progress.
    #[serde(rename = "in-progress")]
    InProgress,

    /// Means a check for this pair was already done and produced a
    /// successful result.
    #[serde(rename = "succeeded")]
    Succeeded,

    /// Means a check for this pair was already done and failed, either never
    /// producing any response or producing an unrecoverable failure
    /// response.
    #[serde(rename = "failed")]
    Failed,

    /// Means a check for this pair is held back until another pair with the
    /// same foundation succeeds.
    #[serde(rename = "frozen")]
    Frozen,
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidatePairState::Waiting => "waiting",
            CandidatePairState::InProgress => "in-progress",
            CandidatePairState::Succeeded => "succeeded",
            CandidatePairState::Failed => "failed",
            CandidatePairState::Frozen => "frozen",
        };
        write!(f, "{}", s)
    }
}

/// Represents a combination of a local and remote candidate, referenced by
/// their arena handles, plus the check-transaction bookkeeping attached to
/// the pair.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: LocalCandidateId,
    pub remote: RemoteCandidateId,
    pub component_id: u16,
    pub state: CandidatePairState,
    pub priority: u64,
    pub is_default: bool,
    pub is_nominated: bool,
    /// The agent role at the time the last check was sent for this pair.
    pub role: Role,
    pub(crate) transaction_id: Option<TransactionId>,
    pub(crate) rto: Duration,
    pub(crate) retransmissions: u32,
    pub(crate) transmission_time: Option<Instant>,
    pub(crate) wait_transaction_timeout: bool,
}

impl CandidatePair {
    pub(crate) fn new(
        local_id: LocalCandidateId,
        local: &Candidate,
        remote_id: RemoteCandidateId,
        remote: &Candidate,
        role: Role,
    ) -> Self {
        Self {
            local: local_id,
            remote: remote_id,
            component_id: local.component_id,
            state: CandidatePairState::Frozen,
            priority: crate::priority::pair_priority(local.priority, remote.priority, role),
            is_default: local.is_default && remote.is_default,
            is_nominated: false,
            role,
            transaction_id: None,
            rto: DEFAULT_RTO,
            retransmissions: 0,
            transmission_time: None,
            wait_transaction_timeout: false,
        }
    }

    /// Moves the pair to `state`. A pair transitioning to Waiting or Failed
    /// no longer has an in-flight transaction, so the stored transaction id
    /// is dropped with the transition.
    pub(crate) fn set_state(&mut self, state: CandidatePairState) {
        if self.state == state {
            return;
        }
        self.state = state;
        match state {
            CandidatePairState::Waiting | CandidatePairState::Failed => {
                self.transaction_id = None;
            }
            CandidatePairState::InProgress
            | CandidatePairState::Succeeded
            | CandidatePairState::Frozen => {}
        }
    }
}

/// A pair that produced a successful, symmetric response, together with the
/// pair whose check generated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidPair {
    pub valid: PairId,
    pub generated_from: PairId,
}

/// Equivalence class of pairs used by the freezing algorithm: the foundation
/// of the local candidate paired with the foundation of the remote one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairFoundation {
    pub local: String,
    pub remote: String,
}

// Log helper resolving pair handles to printable candidates.
pub(crate) struct DisplayPair<'a>(pub &'a Candidate, pub &'a Candidate);

impl fmt::Display for DisplayPair<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.0, self.1)
    }
}
