
use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;
use slotmap::SlotMap;
use stun::agent::TransactionId;

use crate::candidate::*;
use crate::control::Role;
use crate::error::{Error, Result};
use crate::priority::{candidate_priority, pair_priority};
use crate::rand::generate_arbitrary_foundation;

/// State of the check list of a single media stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CheckListState {
    /// The check list is still being driven by the scheduler.
    #[serde(rename = "running")]
    Running,
    /// Every component of the stream has a nominated valid pair.
    #[serde(rename = "completed")]
    Completed,
    /// Every pair has been tried and at least one component has no valid
    /// pair.
    #[serde(rename = "failed")]
    Failed,
}

/// Per-media-stream container driven by the connectivity check engine.
///
/// Candidates and pairs live in keyed arenas; `check_list` holds the pairs
/// eligible for checks ordered by decreasing priority, while `pairs` is the
/// pool owning every pair ever created (valid pairs constructed from a
/// peer-reflexive discovery stay in the pool without joining the ordered
/// list).
#[derive(Debug)]
pub struct CheckList {
    pub(crate) local_candidates: SlotMap<LocalCandidateId, Candidate>,
    pub(crate) remote_candidates: SlotMap<RemoteCandidateId, Candidate>,
    pub(crate) pairs: SlotMap<PairId, CandidatePair>,
    pub(crate) check_list: Vec<PairId>,
    pub(crate) triggered_check_queue: VecDeque<PairId>,
    pub(crate) valid_list: Vec<ValidPair>,
    pub(crate) component_ids: Vec<u16>,
    pub(crate) foundations: Vec<PairFoundation>,
    foundation_generator: u32,
    remote_ufrag: Option<String>,
    remote_pwd: Option<String>,
    pub(crate) state: CheckListState,
    pub(crate) ta_time: Option<Instant>,
    pub(crate) keepalive_time: Option<Instant>,
}

impl Default for CheckList {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckList {
    pub fn new() -> Self {
        Self {
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            pairs: SlotMap::with_key(),
            check_list: Vec::new(),
            triggered_check_queue: VecDeque::new(),
            valid_list: Vec::new(),
            component_ids: Vec::new(),
            foundations: Vec::new(),
            foundation_generator: 1,
            remote_ufrag: None,
            remote_pwd: None,
            state: CheckListState::Running,
            ta_time: None,
            keepalive_time: None,
        }
    }

    pub fn state(&self) -> CheckListState {
        self.state
    }

    /// Sets stream-level remote credentials, overriding the session ones.
    pub fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) {
        self.remote_ufrag = Some(ufrag.to_owned());
        self.remote_pwd = Some(pwd.to_owned());
    }

    pub fn remote_ufrag(&self) -> Option<&str> {
        self.remote_ufrag.as_deref()
    }

    pub fn remote_pwd(&self) -> Option<&str> {
        self.remote_pwd.as_deref()
    }

    fn register_component_id(&mut self, component_id: u16) {
        if !self.component_ids.contains(&component_id) {
            self.component_ids.push(component_id);
        }
    }

    fn check_component_id(component_id: u16) -> Result<()> {
        if !(MIN_COMPONENT_ID..=MAX_COMPONENT_ID).contains(&component_id) {
            return Err(Error::ErrInvalidComponentId);
        }
        Ok(())
    }

    /// Registers a local candidate gathered by the host.
    ///
    /// Host and relayed candidates become their own base; a server-reflexive
    /// candidate may be registered without a base and receive one later via
    /// [`set_base_for_srflx_candidates`](CheckList::set_base_for_srflx_candidates).
    pub fn add_local_candidate(
        &mut self,
        kind: CandidateType,
        component_id: u16,
        addr: TransportAddress,
        base: Option<LocalCandidateId>,
    ) -> Result<LocalCandidateId> {
        Self::check_component_id(component_id)?;

        let priority = candidate_priority(kind, DEFAULT_LOCAL_PREFERENCE, component_id);
        let id = self.local_candidates.insert_with_key(|key| {
            let base = match kind {
                CandidateType::Host | CandidateType::Relay => Some(key),
                _ => base,
            };
            Candidate {
                kind,
                component_id,
                addr,
                priority,
                local_preference: DEFAULT_LOCAL_PREFERENCE,
                foundation: String::new(),
                base,
                is_default: false,
            }
        });
        self.register_component_id(component_id);
        log::debug!(
            "added local candidate {}",
            self.local_candidates[id]
        );
        Ok(id)
    }

    /// Registers a remote candidate received from signaling or learned from
    /// a connectivity check.
    ///
    /// Adding a candidate whose transport address is already known only
    /// refreshes the stored priority. A zero priority is replaced by the
    /// locally computed one.
    pub fn add_remote_candidate(
        &mut self,
        kind: CandidateType,
        component_id: u16,
        addr: TransportAddress,
        priority: u32,
        foundation: &str,
    ) -> Result<RemoteCandidateId> {
        Self::check_component_id(component_id)?;

        let priority = if priority == 0 {
            candidate_priority(kind, DEFAULT_LOCAL_PREFERENCE, component_id)
        } else {
            priority
        };

        if let Some((id, _)) = self
            .remote_candidates
            .iter()
            .find(|(_, c)| c.addr == addr)
        {
            self.remote_candidates[id].priority = priority;
            return Ok(id);
        }

        let id = self.remote_candidates.insert(Candidate {
            kind,
            component_id,
            addr,
            priority,
            local_preference: DEFAULT_LOCAL_PREFERENCE,
            foundation: foundation.to_owned(),
            base: None,
            is_default: false,
        });
        log::debug!(
            "added remote candidate {}",
            self.remote_candidates[id]
        );
        Ok(id)
    }

    /// Learns a remote peer-reflexive candidate from an inbound check
    /// (7.2.1.3): priority comes from the PRIORITY attribute, the foundation
    /// is arbitrary but collision-free within the remote set.
    pub(crate) fn learn_peer_reflexive_remote(
        &mut self,
        component_id: u16,
        addr: TransportAddress,
        priority: u32,
    ) -> Result<RemoteCandidateId> {
        let remote_candidates = &self.remote_candidates;
        let foundation = generate_arbitrary_foundation(|f| {
            remote_candidates.values().any(|c| c.foundation == f)
        });
        log::debug!("learned peer reflexive candidate {}", addr);
        self.add_remote_candidate(
            CandidateType::PeerReflexive,
            component_id,
            addr,
            priority,
            &foundation,
        )
    }

    pub(crate) fn find_local_candidate(&self, addr: &TransportAddress) -> Option<LocalCandidateId> {
        self.local_candidates
            .iter()
            .find(|(_, c)| &c.addr == addr)
            .map(|(id, _)| id)
    }

    pub(crate) fn find_remote_candidate(
        &self,
        addr: &TransportAddress,
    ) -> Option<RemoteCandidateId> {
        self.remote_candidates
            .iter()
            .find(|(_, c)| &c.addr == addr)
            .map(|(id, _)| id)
    }

    /// Assigns a foundation to one local candidate: copied from another
    /// local candidate of the same kind whose base shares the same IP
    /// literal, otherwise a fresh monotone integer.
    pub(crate) fn compute_candidate_foundation(&mut self, id: LocalCandidateId) {
        let (kind, base_ip) = {
            let c = &self.local_candidates[id];
            let base_ip = c
                .base
                .map(|base| self.local_candidates[base].addr.ip.clone());
            (c.kind, base_ip)
        };

        if let Some(base_ip) = &base_ip {
            let shared = self.local_candidates.iter().find(|(other_id, other)| {
                *other_id != id
                    && other.kind == kind
                    && !other.foundation.is_empty()
                    && other
                        .base
                        .map_or(false, |b| self.local_candidates[b].addr.ip == *base_ip)
            });
            if let Some((_, other)) = shared {
                let foundation = other.foundation.clone();
                self.local_candidates[id].foundation = foundation;
                return;
            }
        }

        self.local_candidates[id].foundation = self.foundation_generator.to_string();
        self.foundation_generator += 1;
    }

    /// Assigns foundations to every local candidate of the stream.
    pub fn compute_foundations(&mut self) {
        let ids: Vec<LocalCandidateId> = self.local_candidates.keys().collect();
        for id in ids {
            self.compute_candidate_foundation(id);
        }
    }

    /// Gives every baseless server-reflexive candidate the host candidate of
    /// its component as base.
    pub fn set_base_for_srflx_candidates(&mut self) {
        for component_id in self.component_ids.clone() {
            let host = self
                .local_candidates
                .iter()
                .find(|(_, c)| c.kind == CandidateType::Host && c.component_id == component_id)
                .map(|(id, _)| id);
            let host = match host {
                Some(host) => host,
                None => continue,
            };
            for c in self.local_candidates.values_mut() {
                if c.kind == CandidateType::ServerReflexive
                    && c.base.is_none()
                    && c.component_id == component_id
                {
                    c.base = Some(host);
                }
            }
        }
    }

    /// Marks the default candidate of each registered component, preferring
    /// the types most likely to traverse NATs (4.1.4).
    pub fn choose_default_candidates(&mut self) {
        const DEFAULT_ORDER: [CandidateType; 3] = [
            CandidateType::Relay,
            CandidateType::ServerReflexive,
            CandidateType::Host,
        ];

        for component_id in self.component_ids.clone() {
            for kind in DEFAULT_ORDER.iter() {
                if let Some(c) = self
                    .local_candidates
                    .values_mut()
                    .find(|c| c.kind == *kind && c.component_id == component_id)
                {
                    c.is_default = true;
                    break;
                }
            }
            for kind in DEFAULT_ORDER.iter() {
                if let Some(c) = self
                    .remote_candidates
                    .values_mut()
                    .find(|c| c.kind == *kind && c.component_id == component_id)
                {
                    c.is_default = true;
                    break;
                }
            }
        }
    }

    /// Forms the candidate pairs of the stream, prunes them and orders the
    /// check list (5.7.1 - 5.7.3). On the first check list of a session,
    /// also unfreezes one representative per pair foundation (5.7.4).
    pub fn pair_candidates(&mut self, role: Role, max_connectivity_checks: usize, first: bool) {
        self.form_pairs(role);
        self.prune_pairs(max_connectivity_checks);
        self.generate_pair_foundations();
        if first {
            self.compute_initial_states();
        }
    }

    fn form_pairs(&mut self, role: Role) {
        for (local_id, local) in &self.local_candidates {
            for (remote_id, remote) in &self.remote_candidates {
                if local.component_id != remote.component_id {
                    continue;
                }
                let exists = self
                    .pairs
                    .values()
                    .any(|p| p.local == local_id && p.remote == remote_id);
                if exists {
                    continue;
                }
                self.pairs
                    .insert(CandidatePair::new(local_id, local, remote_id, remote, role));
            }
        }
    }

    /// Prunes pairs (5.7.3): collapse server-reflexive locals onto their
    /// base, drop the lower-priority duplicate, order what remains, then cut
    /// the list down to `max_connectivity_checks`.
    fn prune_pairs(&mut self, max_connectivity_checks: usize) {
        let pair_ids: Vec<PairId> = self.pairs.keys().collect();

        for &id in &pair_ids {
            let local = self.pairs[id].local;
            if self.local_candidates[local].kind == CandidateType::ServerReflexive {
                if let Some(base) = self.local_candidates[local].base {
                    self.pairs[id].local = base;
                    // the swap changes the local endpoint, so the default
                    // flag must reflect the base candidate
                    let remote = self.pairs[id].remote;
                    self.pairs[id].is_default = self.local_candidates[base].is_default
                        && self.remote_candidates[remote].is_default;
                }
            }
        }

        let mut kept: Vec<PairId> = Vec::new();
        let mut removed: Vec<PairId> = Vec::new();
        for &id in &pair_ids {
            let (local, remote, priority) = {
                let p = &self.pairs[id];
                (p.local, p.remote, p.priority)
            };
            let twin = kept.iter().position(|&other| {
                self.pairs[other].local == local && self.pairs[other].remote == remote
            });
            match twin {
                Some(pos) if self.pairs[kept[pos]].priority >= priority => removed.push(id),
                Some(pos) => {
                    removed.push(kept[pos]);
                    kept[pos] = id;
                }
                None => kept.push(id),
            }
        }
        for id in removed {
            self.pairs.remove(id);
            log::debug!("pruned duplicate pair");
        }

        self.check_list = self.pairs.keys().collect();
        self.sort_check_list();

        while self.check_list.len() > max_connectivity_checks {
            if let Some(id) = self.check_list.pop() {
                self.pairs.remove(id);
            }
        }
    }

    fn generate_pair_foundations(&mut self) {
        for &id in &self.check_list {
            let p = &self.pairs[id];
            let foundation = PairFoundation {
                local: self.local_candidates[p.local].foundation.clone(),
                remote: self.remote_candidates[p.remote].foundation.clone(),
            };
            if !self.foundations.contains(&foundation) {
                self.foundations.push(foundation);
            }
        }
    }

    /// Sets the initial Waiting pairs (5.7.4): for each distinct pair
    /// foundation, the pair with the lowest component id, ties broken by
    /// highest priority.
    fn compute_initial_states(&mut self) {
        for foundation in self.foundations.clone() {
            let mut representative: Option<PairId> = None;
            for &id in &self.check_list {
                if !self.pair_has_foundation(id, &foundation) {
                    continue;
                }
                representative = match representative {
                    None => Some(id),
                    Some(best) => {
                        let best_pair = &self.pairs[best];
                        let p = &self.pairs[id];
                        let better = p.component_id < best_pair.component_id
                            || (p.component_id == best_pair.component_id
                                && p.priority > best_pair.priority);
                        Some(if better { id } else { best })
                    }
                };
            }
            if let Some(id) = representative {
                self.pairs[id].set_state(CandidatePairState::Waiting);
            }
        }
    }

    pub(crate) fn pair_has_foundation(&self, id: PairId, foundation: &PairFoundation) -> bool {
        let p = &self.pairs[id];
        self.local_candidates[p.local].foundation == foundation.local
            && self.remote_candidates[p.remote].foundation == foundation.remote
    }

    pub(crate) fn sort_check_list(&mut self) {
        let pairs = &self.pairs;
        self.check_list
            .sort_by(|&a, &b| pairs[b].priority.cmp(&pairs[a].priority));
    }

    pub(crate) fn sort_valid_list(&mut self) {
        let pairs = &self.pairs;
        self.valid_list
            .sort_by(|a, b| pairs[b.valid].priority.cmp(&pairs[a.valid].priority));
    }

    /// Adds a pair to the pool and priority-inserts it into the check list.
    pub(crate) fn add_pair(&mut self, pair: CandidatePair) -> PairId {
        let priority = pair.priority;
        let id = self.pairs.insert(pair);
        let pos = self
            .check_list
            .iter()
            .position(|&other| self.pairs[other].priority < priority)
            .unwrap_or(self.check_list.len());
        self.check_list.insert(pos, id);
        id
    }

    /// Adds a pair to the pool only; used for valid pairs constructed from a
    /// mapped address that matches no existing pair (7.1.3.2.2).
    pub(crate) fn add_pool_pair(&mut self, pair: CandidatePair) -> PairId {
        self.pairs.insert(pair)
    }

    pub(crate) fn find_pair(
        &self,
        local: LocalCandidateId,
        remote: RemoteCandidateId,
    ) -> Option<PairId> {
        self.check_list
            .iter()
            .copied()
            .find(|&id| self.pairs[id].local == local && self.pairs[id].remote == remote)
    }

    pub(crate) fn find_pair_by_transaction_id(&self, transaction_id: TransactionId) -> Option<PairId> {
        self.check_list
            .iter()
            .copied()
            .find(|&id| self.pairs[id].transaction_id == Some(transaction_id))
    }

    /// Queues a triggered check unless the pair already waits in the queue.
    pub(crate) fn queue_triggered_check(&mut self, id: PairId) {
        if !self.triggered_check_queue.contains(&id) {
            self.triggered_check_queue.push_back(id);
        }
    }

    pub(crate) fn pop_triggered_check(&mut self) -> Option<PairId> {
        self.triggered_check_queue.pop_front()
    }

    /// Records a valid pair, keeping the valid list ordered by decreasing
    /// priority and free of duplicate (valid, generated_from) entries.
    pub(crate) fn add_valid_pair(&mut self, valid: PairId, generated_from: PairId) {
        let entry = ValidPair {
            valid,
            generated_from,
        };
        if self.valid_list.contains(&entry) {
            log::debug!("pair already in the valid list");
            return;
        }
        let priority = self.pairs[valid].priority;
        let pos = self
            .valid_list
            .iter()
            .position(|other| self.pairs[other.valid].priority < priority)
            .unwrap_or(self.valid_list.len());
        self.valid_list.insert(pos, entry);
    }

    pub(crate) fn nominated_valid_pair(&self, component_id: u16) -> Option<&ValidPair> {
        self.valid_list.iter().find(|vp| {
            let p = &self.pairs[vp.valid];
            p.is_nominated && p.component_id == component_id
        })
    }

    /// Recomputes every pair priority after a role change and restores the
    /// sorted order of the check list and the valid list.
    pub(crate) fn recompute_pair_priorities(&mut self, role: Role) {
        let ids: Vec<PairId> = self.pairs.keys().collect();
        for id in ids {
            let (local, remote) = {
                let p = &self.pairs[id];
                (p.local, p.remote)
            };
            self.pairs[id].priority = pair_priority(
                self.local_candidates[local].priority,
                self.remote_candidates[remote].priority,
                role,
            );
        }
        self.sort_check_list();
        self.sort_valid_list();
    }

    /// The default local candidate advertised for the stream (component id
    /// 1).
    pub fn default_local_candidate(&self) -> Option<&Candidate> {
        self.local_candidates
            .values()
            .find(|c| c.component_id == COMPONENT_RTP && c.is_default)
    }

    /// After completion: the remote transport addresses media must be sent
    /// to, one port per component, the address taken from component 1.
    pub fn selected_remote_addresses(&self) -> Option<SelectedRemoteAddresses> {
        let mut result = SelectedRemoteAddresses {
            addr: String::new(),
            rtp_port: 0,
            rtcp_port: None,
        };
        for &component_id in &self.component_ids {
            let vp = self.nominated_valid_pair(component_id)?;
            let remote = &self.remote_candidates[self.pairs[vp.valid].remote];
            match component_id {
                COMPONENT_RTP => {
                    result.addr = remote.addr.ip.clone();
                    result.rtp_port = remote.addr.port;
                }
                COMPONENT_RTCP => result.rtcp_port = Some(remote.addr.port),
                _ => {}
            }
        }
        Some(result)
    }
}

/// Where to reach the peer once a check list completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedRemoteAddresses {
    pub addr: String,
    pub rtp_port: u16,
    pub rtcp_port: Option<u16>,
}
