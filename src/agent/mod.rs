#[cfg(test)]
mod agent_test;

pub mod agent_config;
pub(crate) mod agent_internal;
pub(crate) mod agent_scheduler;
pub mod agent_stats;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;

use crate::candidate::Candidate;
use crate::check_list::CheckList;
use crate::control::Role;
use crate::error::{Error, Result};
use crate::rand::{generate_pwd, generate_tie_breaker, generate_ufrag};
use agent_config::*;

/// Overall state of an ICE session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Candidates may be registered but no checks are running yet.
    #[serde(rename = "stopped")]
    Stopped,
    /// Candidate pairs have been formed and checks are being scheduled.
    #[serde(rename = "running")]
    Running,
    /// Every check list completed.
    #[serde(rename = "completed")]
    Completed,
    /// Every check list finished and at least one failed.
    #[serde(rename = "failed")]
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            SessionState::Stopped => "stopped",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A message received on one of the host's sockets, as handed to
/// [`Agent::handle_packet`].
pub struct ReceivedPacket {
    /// The received data.
    pub data: Vec<u8>,
    /// Source address of the message.
    pub source: SocketAddr,
    /// Local address the message was received on (interface address plus the
    /// RTP local port for component 1, RTP local port + 1 for component 2).
    pub destination: SocketAddr,
    /// The component whose socket received this message.
    pub component_id: u16,
}

/// Notifications emitted by the engine while it runs.
///
/// Events are delivered inside the engine's execution; handlers must not
/// call back into the agent synchronously.
#[derive(Debug)]
pub enum IceEvent {
    /// Transmit `data` to `target` on the socket of `component_id`, bound to
    /// the local interface holding `source`.
    SendData {
        component_id: u16,
        data: Vec<u8>,
        source: SocketAddr,
        target: SocketAddr,
    },
    /// The check list reached Completed; emitted exactly once per list.
    CheckListCompleted { check_list: usize },
}

/// Session-wide parameters shared by every check list.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) role: Role,
    pub(crate) tie_breaker: u64,
    pub(crate) local_ufrag: String,
    pub(crate) local_pwd: String,
    pub(crate) remote_ufrag: Option<String>,
    pub(crate) remote_pwd: Option<String>,
    pub(crate) ta: Duration,
    pub(crate) keepalive_timeout: Duration,
    pub(crate) max_connectivity_checks: usize,
    pub(crate) state: SessionState,
}

/// The ICE agent: one session owning a check list per media stream, driven
/// by packet delivery and a periodic Ta tick.
#[derive(Debug)]
pub struct Agent {
    pub(crate) session: Session,
    pub(crate) streams: Vec<CheckList>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let local_ufrag = if config.local_ufrag.is_empty() {
            generate_ufrag()
        } else {
            validate_ufrag(&config.local_ufrag)?;
            config.local_ufrag
        };
        let local_pwd = if config.local_pwd.is_empty() {
            generate_pwd()
        } else {
            validate_pwd(&config.local_pwd)?;
            config.local_pwd
        };

        let max_connectivity_checks = if config.max_connectivity_checks == 0 {
            DEFAULT_MAX_CONNECTIVITY_CHECKS
        } else {
            config.max_connectivity_checks
        };

        Ok(Self {
            session: Session {
                role: config.role,
                tie_breaker: generate_tie_breaker(),
                local_ufrag,
                local_pwd,
                remote_ufrag: None,
                remote_pwd: None,
                ta: DEFAULT_TA,
                keepalive_timeout: config.keepalive_timeout.max(DEFAULT_KEEPALIVE_TIMEOUT),
                max_connectivity_checks,
                state: SessionState::Stopped,
            },
            streams: Vec::new(),
        })
    }

    /// Registers a new media stream and returns its check list index.
    pub fn add_check_list(&mut self) -> usize {
        self.streams.push(CheckList::new());
        self.streams.len() - 1
    }

    pub fn check_list(&self, index: usize) -> Option<&CheckList> {
        self.streams.get(index)
    }

    pub fn check_list_mut(&mut self, index: usize) -> Option<&mut CheckList> {
        self.streams.get_mut(index)
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn role(&self) -> Role {
        self.session.role
    }

    pub fn tie_breaker(&self) -> u64 {
        self.session.tie_breaker
    }

    #[cfg(test)]
    pub(crate) fn set_tie_breaker(&mut self, tie_breaker: u64) {
        self.session.tie_breaker = tie_breaker;
    }

    /// Switches the agent role. Pair priorities depend on the role, so every
    /// pair of every check list is re-prioritized on an actual change.
    pub fn set_role(&mut self, role: Role) {
        if self.session.role == role {
            return;
        }
        log::info!("switching to the {} role", role);
        self.session.role = role;
        for cl in &mut self.streams {
            cl.recompute_pair_priorities(role);
        }
    }

    pub fn local_ufrag(&self) -> &str {
        &self.session.local_ufrag
    }

    pub fn local_pwd(&self) -> &str {
        &self.session.local_pwd
    }

    pub fn remote_ufrag(&self) -> Option<&str> {
        self.session.remote_ufrag.as_deref()
    }

    pub fn remote_pwd(&self) -> Option<&str> {
        self.session.remote_pwd.as_deref()
    }

    pub fn set_local_credentials(&mut self, ufrag: &str, pwd: &str) -> Result<()> {
        validate_ufrag(ufrag)?;
        validate_pwd(pwd)?;
        self.session.local_ufrag = ufrag.to_owned();
        self.session.local_pwd = pwd.to_owned();
        Ok(())
    }

    /// Sets the credentials of the remote agent.
    pub fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) -> Result<()> {
        if ufrag.is_empty() {
            return Err(Error::ErrRemoteUfragEmpty);
        } else if pwd.is_empty() {
            return Err(Error::ErrRemotePwdEmpty);
        }
        self.session.remote_ufrag = Some(ufrag.to_owned());
        self.session.remote_pwd = Some(pwd.to_owned());
        Ok(())
    }

    pub fn set_max_connectivity_checks(&mut self, max_connectivity_checks: usize) {
        self.session.max_connectivity_checks = max_connectivity_checks;
    }

    /// Sets the keep-alive interval, clamped to the 15 s floor.
    pub fn set_keepalive_timeout(&mut self, timeout: Duration) {
        self.session.keepalive_timeout = timeout.max(DEFAULT_KEEPALIVE_TIMEOUT);
    }

    /// Remote ufrag effective for a stream: the per-stream override when
    /// set, the session-level value otherwise.
    pub fn check_list_remote_ufrag(&self, index: usize) -> Option<&str> {
        let cl = self.streams.get(index)?;
        cl.remote_ufrag().or_else(|| self.remote_ufrag())
    }

    /// Remote pwd effective for a stream, with the same fallback.
    pub fn check_list_remote_pwd(&self, index: usize) -> Option<&str> {
        let cl = self.streams.get(index)?;
        cl.remote_pwd().or_else(|| self.remote_pwd())
    }

    /// Assigns foundations to the local candidates of every stream.
    pub fn compute_foundations(&mut self) {
        for cl in &mut self.streams {
            cl.compute_foundations();
        }
    }

    /// Marks default candidates on every stream.
    pub fn choose_default_candidates(&mut self) {
        for cl in &mut self.streams {
            cl.choose_default_candidates();
        }
    }

    /// Resolves the base of server-reflexive candidates on every stream.
    pub fn set_base_for_srflx_candidates(&mut self) {
        for cl in &mut self.streams {
            cl.set_base_for_srflx_candidates();
        }
    }

    /// Forms and prunes candidate pairs on every check list and starts the
    /// session. Only the first check list receives initial Waiting pairs;
    /// the others unfreeze as checks succeed (5.7.4).
    pub fn pair_candidates(&mut self) {
        let role = self.session.role;
        let max_checks = self.session.max_connectivity_checks;
        for (index, cl) in self.streams.iter_mut().enumerate() {
            cl.pair_candidates(role, max_checks, index == 0);
        }
        self.session.state = SessionState::Running;
    }

    /// The default local candidate of a stream (component id 1).
    pub fn default_local_candidate(&self, index: usize) -> Option<&Candidate> {
        self.streams.get(index)?.default_local_candidate()
    }
}

fn validate_ufrag(ufrag: &str) -> Result<()> {
    if ufrag.len() * 8 < 24 {
        return Err(Error::ErrLocalUfragInsufficientBits);
    }
    Ok(())
}

fn validate_pwd(pwd: &str) -> Result<()> {
    if pwd.len() * 8 < 128 {
        return Err(Error::ErrLocalPwdInsufficientBits);
    }
    Ok(())
}
