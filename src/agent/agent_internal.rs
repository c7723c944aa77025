use std::net::SocketAddr;
use std::time::Instant;

use stun::attributes::*;
use stun::error_code::{ErrorCode, ErrorCodeAttribute, CODE_BAD_REQUEST, CODE_ROLE_CONFLICT, CODE_UNAUTHORIZED};
use stun::message::*;
use stun::xoraddr::XorMappedAddress;

use super::{Agent, IceEvent, ReceivedPacket, SessionState};
use crate::binding;
use crate::candidate::*;
use crate::check_list::{CheckList, CheckListState};
use crate::control::{AttrControlled, AttrControlling, Role};
use crate::priority::PriorityAttr;
use crate::use_candidate::UseCandidateAttr;

impl Agent {
    /// Processes one STUN message delivered by the host's socket layer.
    ///
    /// Runs to completion and mutates the check list in place; transmission
    /// and completion notifications are emitted through `on_event`.
    pub fn handle_packet(
        &mut self,
        check_list: usize,
        pkt: &ReceivedPacket,
        now: Instant,
        mut on_event: impl FnMut(IceEvent),
    ) {
        if check_list >= self.streams.len() {
            log::warn!("dropping packet for unknown check list {}", check_list);
            return;
        }

        let mut msg = Message {
            raw: vec![],
            ..Message::default()
        };
        msg.raw.extend_from_slice(&pkt.data);
        if let Err(err) = msg.decode() {
            log::warn!("received invalid STUN packet from {}: {}", pkt.source, err);
            return;
        }

        if msg.contains(ATTR_FINGERPRINT) && binding::verify_fingerprint(&msg).is_err() {
            log::warn!("received STUN packet from {} with a bad FINGERPRINT", pkt.source);
            return;
        }

        if msg.typ.method != METHOD_BINDING {
            log::trace!(
                "unhandled STUN method from {}: {}",
                pkt.source,
                msg.typ.method
            );
            return;
        }

        let on_event: &mut dyn FnMut(IceEvent) = &mut on_event;
        if msg.typ.class == CLASS_REQUEST {
            log::debug!("received binding request from {}", pkt.source);
            self.handle_binding_request(check_list, pkt, &mut msg, now, on_event);
        } else if msg.typ.class == CLASS_SUCCESS_RESPONSE {
            log::debug!("received binding response from {}", pkt.source);
            self.handle_binding_success(check_list, pkt, &msg, now, on_event);
        } else if msg.typ.class == CLASS_ERROR_RESPONSE {
            log::debug!("received error response from {}", pkt.source);
            self.handle_binding_error(check_list, &msg, now, on_event);
        } else {
            log::trace!("received binding indication from {}", pkt.source);
        }
    }

    /// Handles a connectivity check from the peer (7.2).
    fn handle_binding_request(
        &mut self,
        index: usize,
        pkt: &ReceivedPacket,
        msg: &mut Message,
        now: Instant,
        on_event: &mut dyn FnMut(IceEvent),
    ) {
        let missing = if !msg.contains(ATTR_MESSAGE_INTEGRITY) {
            Some("Missing MESSAGE-INTEGRITY attribute")
        } else if !msg.contains(ATTR_USERNAME) {
            Some("Missing USERNAME attribute")
        } else if !msg.contains(ATTR_FINGERPRINT) {
            Some("Missing FINGERPRINT attribute")
        } else if !msg.contains(ATTR_PRIORITY) {
            Some("Missing PRIORITY attribute")
        } else if msg.contains(ATTR_ICE_CONTROLLING) == msg.contains(ATTR_ICE_CONTROLLED) {
            // either none or both; a well-formed check carries exactly one
            Some("Missing ICE-CONTROLLING or ICE-CONTROLLED attribute")
        } else {
            None
        };
        if let Some(reason) = missing {
            log::warn!("binding request from {}: {}", pkt.source, reason);
            self.send_binding_error(pkt, msg, CODE_BAD_REQUEST, reason, on_event);
            return;
        }

        if binding::verify_integrity(msg, &self.session.local_pwd).is_err() {
            log::warn!("wrong MESSAGE-INTEGRITY in binding request from {}", pkt.source);
            self.send_binding_error(
                pkt,
                msg,
                CODE_UNAUTHORIZED,
                "Wrong MESSAGE-INTEGRITY attribute",
                on_event,
            );
            return;
        }

        if binding::verify_username(msg, &self.session.local_ufrag).is_err() {
            log::warn!("wrong USERNAME in binding request from {}", pkt.source);
            self.send_binding_error(
                pkt,
                msg,
                CODE_UNAUTHORIZED,
                "Wrong USERNAME attribute",
                on_event,
            );
            return;
        }

        if !self.resolve_role_conflict(pkt, msg, on_event) {
            return;
        }

        let mut priority = PriorityAttr::default();
        if priority.get_from(msg).is_err() {
            log::warn!("malformed PRIORITY in binding request from {}", pkt.source);
            self.send_binding_error(
                pkt,
                msg,
                CODE_BAD_REQUEST,
                "Malformed PRIORITY attribute",
                on_event,
            );
            return;
        }
        let use_candidate = UseCandidateAttr::is_set(msg);
        let role = self.session.role;

        let cl = &mut self.streams[index];

        // 7.2.1.3: the source of a check we did not know about is a new
        // peer-reflexive remote candidate
        let remote_taddr = TransportAddress::from(pkt.source);
        let remote_id = match cl.find_remote_candidate(&remote_taddr) {
            Some(id) => Some(id),
            None => match cl.learn_peer_reflexive_remote(pkt.component_id, remote_taddr, priority.0)
            {
                Ok(id) => Some(id),
                Err(err) => {
                    log::warn!("failed to learn peer reflexive candidate: {}", err);
                    None
                }
            },
        };

        // 7.2.1.4: triggered check on the pair the request exercised
        let local_taddr = TransportAddress::from(pkt.destination);
        let pair_id = match (cl.find_local_candidate(&local_taddr), remote_id) {
            (Some(local_id), Some(remote_id)) => Some(cl.trigger_check(role, local_id, remote_id)),
            (None, _) => {
                log::warn!("no local candidate matches {}", local_taddr);
                None
            }
            _ => None,
        };

        // 7.2.1.5: a nominating check from the controlling peer marks the
        // pair once it has succeeded
        if let Some(pair_id) = pair_id {
            if use_candidate
                && role == Role::Controlled
                && cl.pairs[pair_id].state == CandidatePairState::Succeeded
            {
                cl.pairs[pair_id].is_nominated = true;
            }
        }

        // 7.2.1.6: reflect the source address back in the success response
        match binding::make_binding_success(msg, pkt.source, &self.session.local_pwd) {
            Ok(response) => on_event(IceEvent::SendData {
                component_id: pkt.component_id,
                data: response.raw,
                source: pkt.destination,
                target: pkt.source,
            }),
            Err(err) => log::warn!("failed to build binding success: {}", err),
        }

        self.conclude(index, now, on_event);
        self.update_session_state();
    }

    /// Detects and repairs role conflicts (7.2.1.1). Returns false when the
    /// request was answered with 487 and must not be processed further.
    fn resolve_role_conflict(
        &mut self,
        pkt: &ReceivedPacket,
        msg: &Message,
        on_event: &mut dyn FnMut(IceEvent),
    ) -> bool {
        match self.session.role {
            Role::Controlling => {
                let mut remote = AttrControlling::default();
                if remote.get_from(msg).is_ok() {
                    log::warn!("role conflict, both agents are controlling");
                    if self.session.tie_breaker >= remote.0 {
                        self.send_binding_error(pkt, msg, CODE_ROLE_CONFLICT, "Role Conflict", on_event);
                        return false;
                    }
                    self.set_role(Role::Controlled);
                }
            }
            Role::Controlled => {
                let mut remote = AttrControlled::default();
                if remote.get_from(msg).is_ok() {
                    log::warn!("role conflict, both agents are controlled");
                    if self.session.tie_breaker >= remote.0 {
                        self.set_role(Role::Controlling);
                    } else {
                        self.send_binding_error(pkt, msg, CODE_ROLE_CONFLICT, "Role Conflict", on_event);
                        return false;
                    }
                }
            }
        }
        true
    }

    fn send_binding_error(
        &self,
        pkt: &ReceivedPacket,
        msg: &Message,
        code: ErrorCode,
        reason: &str,
        on_event: &mut dyn FnMut(IceEvent),
    ) {
        match binding::make_binding_error(msg, code, reason) {
            Ok(response) => {
                log::debug!("sending error response {} to {}", code.0, pkt.source);
                on_event(IceEvent::SendData {
                    component_id: pkt.component_id,
                    data: response.raw,
                    source: pkt.destination,
                    target: pkt.source,
                });
            }
            Err(err) => log::warn!("failed to build error response: {}", err),
        }
    }

    /// Handles a success response to one of our checks (7.1.3).
    fn handle_binding_success(
        &mut self,
        index: usize,
        pkt: &ReceivedPacket,
        msg: &Message,
        now: Instant,
        on_event: &mut dyn FnMut(IceEvent),
    ) {
        let role = self.session.role;
        let cl = &mut self.streams[index];

        let pair_id = match cl.find_pair_by_transaction_id(msg.transaction_id) {
            Some(id) => id,
            None => {
                log::warn!(
                    "binding response from {} with unknown transaction id {:?}",
                    pkt.source,
                    msg.transaction_id
                );
                return;
            }
        };

        // 7.1.3.1: source and destination must be symmetric with the request
        let (local_addr, remote_addr) = {
            let p = &cl.pairs[pair_id];
            (
                cl.local_candidates[p.local].addr.clone(),
                cl.remote_candidates[p.remote].addr.clone(),
            )
        };
        if TransportAddress::from(pkt.source) != remote_addr
            || TransportAddress::from(pkt.destination) != local_addr
        {
            log::warn!(
                "non-symmetric addresses in binding response from {}, failing pair",
                pkt.source
            );
            cl.pairs[pair_id].set_state(CandidatePairState::Failed);
            return;
        }

        if !msg.contains(ATTR_USERNAME)
            || !msg.contains(ATTR_FINGERPRINT)
            || !msg.contains(ATTR_XORMAPPED_ADDRESS)
        {
            log::warn!("binding response from {} missing required attributes", pkt.source);
            return;
        }

        // 7.1.3.2.1: an unknown mapped address is a new peer-reflexive local
        let mut mapped = XorMappedAddress::default();
        if mapped.get_from(msg).is_err() {
            log::warn!("malformed XOR-MAPPED-ADDRESS in binding response from {}", pkt.source);
            return;
        }
        let mapped_taddr = TransportAddress::from(SocketAddr::new(mapped.ip, mapped.port));
        let prflx_local = if cl.find_local_candidate(&mapped_taddr).is_none() {
            let (base, component_id) = {
                let p = &cl.pairs[pair_id];
                (p.local, p.component_id)
            };
            log::debug!("discovered peer reflexive candidate {}", mapped_taddr);
            match cl.add_local_candidate(
                CandidateType::PeerReflexive,
                component_id,
                mapped_taddr,
                Some(base),
            ) {
                Ok(id) => {
                    cl.compute_candidate_foundation(id);
                    Some(id)
                }
                Err(err) => {
                    log::warn!("failed to add peer reflexive candidate: {}", err);
                    return;
                }
            }
        } else {
            None
        };

        // 7.1.3.2.2 - 7.1.3.2.4
        let previous_state = cl.pairs[pair_id].state;
        let valid_id = cl.construct_valid_pair(
            prflx_local,
            TransportAddress::from(pkt.destination),
            pair_id,
            role,
        );
        cl.update_pair_states_on_response(pair_id);
        if let Some(valid_id) = valid_id {
            let nominate = match role {
                // our own nominating check, carrying USE-CANDIDATE, came back
                Role::Controlling => cl.pairs[pair_id].is_nominated,
                // the triggered check the peer's nomination spawned came
                // back; only the first valid pair of a component settles it
                Role::Controlled => {
                    previous_state == CandidatePairState::InProgress
                        && cl
                            .nominated_valid_pair(cl.pairs[valid_id].component_id)
                            .is_none()
                }
            };
            if nominate {
                cl.pairs[valid_id].is_nominated = true;
            }
        }

        self.conclude(index, now, on_event);
        self.update_session_state();
    }

    /// Handles an error response to one of our checks (7.1.3.1).
    fn handle_binding_error(
        &mut self,
        index: usize,
        msg: &Message,
        now: Instant,
        on_event: &mut dyn FnMut(IceEvent),
    ) {
        let cl = &mut self.streams[index];
        let pair_id = match cl.find_pair_by_transaction_id(msg.transaction_id) {
            Some(id) => id,
            None => {
                log::debug!("error response with unknown transaction id, ignoring");
                return;
            }
        };

        log::debug!("error response, failing pair");
        cl.pairs[pair_id].set_state(CandidatePairState::Failed);

        let mut error_code = ErrorCodeAttribute::default();
        if error_code.get_from(msg).is_ok() && error_code.code == CODE_ROLE_CONFLICT {
            // the role we sent the check under lost the conflict; adopt the
            // other one, then retry the pair
            let switched = cl.pairs[pair_id].role.opposite();
            cl.pairs[pair_id].set_state(CandidatePairState::Waiting);
            cl.queue_triggered_check(pair_id);
            self.set_role(switched);
        }

        self.conclude(index, now, on_event);
        self.update_session_state();
    }

    /// Concludes ICE processing (8.1): nominate, stop redundant work, then
    /// decide completion or failure of the check list.
    pub(crate) fn conclude(
        &mut self,
        index: usize,
        now: Instant,
        on_event: &mut dyn FnMut(IceEvent),
    ) {
        let role = self.session.role;
        let cl = &mut self.streams[index];

        // 8.1.1.1: regular nomination; the highest-priority valid pair of
        // each component still lacking a nomination has its generated_from
        // re-checked with USE-CANDIDATE
        if role == Role::Controlling {
            let mut handled: Vec<u16> = Vec::new();
            for i in 0..cl.valid_list.len() {
                let vp = cl.valid_list[i];
                let component_id = cl.pairs[vp.valid].component_id;
                if handled.contains(&component_id)
                    || cl.nominated_valid_pair(component_id).is_some()
                {
                    continue;
                }
                handled.push(component_id);
                log::debug!("nominating a pair for component {}", component_id);
                cl.pairs[vp.generated_from].is_nominated = true;
                cl.queue_triggered_check(vp.generated_from);
            }
        }

        // 8.1.2: a nominated component no longer needs its pending checks
        let nominated_components: Vec<u16> = cl
            .valid_list
            .iter()
            .filter(|vp| cl.pairs[vp.valid].is_nominated)
            .map(|vp| cl.pairs[vp.valid].component_id)
            .collect();
        for component_id in nominated_components {
            let pairs = &cl.pairs;
            let drop_pending = |id: &PairId| {
                let p = &pairs[*id];
                !(p.component_id == component_id
                    && matches!(
                        p.state,
                        CandidatePairState::Waiting | CandidatePairState::Frozen
                    ))
            };
            cl.check_list.retain(drop_pending);
            cl.triggered_check_queue.retain(drop_pending);
            for i in 0..cl.check_list.len() {
                let id = cl.check_list[i];
                if cl.pairs[id].state == CandidatePairState::InProgress
                    && cl.pairs[id].component_id == component_id
                {
                    cl.pairs[id].retransmissions = MAX_RETRANSMISSIONS;
                }
            }
        }

        // completion: every component has a nominated valid pair
        let complete = !cl.component_ids.is_empty()
            && cl
                .component_ids
                .iter()
                .all(|&c| cl.nominated_valid_pair(c).is_some());
        if complete {
            if cl.state != CheckListState::Completed {
                cl.state = CheckListState::Completed;
                cl.keepalive_time = Some(now);
                log::info!("check list {} completed", index);
                on_event(IceEvent::CheckListCompleted { check_list: index });
            }
        } else {
            let pairs = &cl.pairs;
            let all_done = cl.check_list.iter().all(|&id| {
                matches!(
                    pairs[id].state,
                    CandidatePairState::Failed | CandidatePairState::Succeeded
                )
            });
            if all_done && cl.state != CheckListState::Failed {
                cl.state = CheckListState::Failed;
                log::info!("check list {} failed", index);
            }
        }
    }

    /// Propagates check-list outcomes to the session state.
    pub(crate) fn update_session_state(&mut self) {
        if self.session.state != SessionState::Running || self.streams.is_empty() {
            return;
        }
        let all_done = self
            .streams
            .iter()
            .all(|cl| cl.state() != CheckListState::Running);
        if !all_done {
            return;
        }
        let any_failed = self
            .streams
            .iter()
            .any(|cl| cl.state() == CheckListState::Failed);
        self.session.state = if any_failed {
            SessionState::Failed
        } else {
            SessionState::Completed
        };
        log::info!("session {}", self.session.state);
    }
}

impl CheckList {
    /// Triggered check on the pair a binding request arrived on (7.2.1.4).
    pub(crate) fn trigger_check(
        &mut self,
        role: Role,
        local: LocalCandidateId,
        remote: RemoteCandidateId,
    ) -> PairId {
        if let Some(id) = self.find_pair(local, remote) {
            match self.pairs[id].state {
                CandidatePairState::Waiting
                | CandidatePairState::Frozen
                | CandidatePairState::Failed => {
                    self.pairs[id].set_state(CandidatePairState::Waiting);
                    self.queue_triggered_check(id);
                }
                CandidatePairState::InProgress => {
                    // wait out the in-flight transaction before re-checking
                    self.pairs[id].wait_transaction_timeout = true;
                }
                CandidatePairState::Succeeded => {}
            }
            id
        } else {
            log::debug!("adding pair to the check list from a triggered check");
            let pair = CandidatePair::new(
                local,
                &self.local_candidates[local],
                remote,
                &self.remote_candidates[remote],
                role,
            );
            let id = self.add_pair(pair);
            self.pairs[id].set_state(CandidatePairState::Waiting);
            self.queue_triggered_check(id);
            id
        }
    }

    /// Constructs the valid pair a success response proves usable
    /// (7.1.3.2.2). A pair unknown to the check list joins the pool only.
    pub(crate) fn construct_valid_pair(
        &mut self,
        prflx_local: Option<LocalCandidateId>,
        destination: TransportAddress,
        succeeded: PairId,
        role: Role,
    ) -> Option<PairId> {
        let local = match prflx_local {
            Some(id) => id,
            None => match self.find_local_candidate(&destination) {
                Some(id) => id,
                None => {
                    log::warn!("no local candidate matches {}", destination);
                    return None;
                }
            },
        };
        let remote = self.pairs[succeeded].remote;

        let valid = match self.find_pair(local, remote) {
            Some(id) => id,
            None => {
                let pair = CandidatePair::new(
                    local,
                    &self.local_candidates[local],
                    remote,
                    &self.remote_candidates[remote],
                    role,
                );
                self.add_pool_pair(pair)
            }
        };

        log::debug!(
            "adding pair to the valid list: {}",
            DisplayPair(
                &self.local_candidates[local],
                &self.remote_candidates[remote]
            )
        );
        self.add_valid_pair(valid, succeeded);
        Some(valid)
    }

    /// Updates pair states after a succeeded check (7.1.3.2.3): the
    /// succeeded pair settles, frozen pairs sharing its foundation unfreeze.
    pub(crate) fn update_pair_states_on_response(&mut self, succeeded: PairId) {
        self.pairs[succeeded].set_state(CandidatePairState::Succeeded);

        let foundation = {
            let p = &self.pairs[succeeded];
            PairFoundation {
                local: self.local_candidates[p.local].foundation.clone(),
                remote: self.remote_candidates[p.remote].foundation.clone(),
            }
        };
        for i in 0..self.check_list.len() {
            let id = self.check_list[i];
            if id != succeeded
                && self.pairs[id].state == CandidatePairState::Frozen
                && self.pair_has_foundation(id, &foundation)
            {
                log::debug!("unfreezing pair with foundation {}:{}", foundation.local, foundation.remote);
                self.pairs[id].set_state(CandidatePairState::Waiting);
            }
        }
    }
}
