use std::time::Instant;

use stun::agent::TransactionId;

use super::{Agent, IceEvent, SessionState};
use crate::binding;
use crate::candidate::*;
use crate::check_list::CheckListState;
use crate::control::Role;
use crate::priority::prflx_priority;

impl Agent {
    /// Runs one scheduling pass for a single check list. The host calls
    /// this on a ticker with the Ta period (20 ms).
    pub fn process(&mut self, check_list: usize, now: Instant, mut on_event: impl FnMut(IceEvent)) {
        self.process_check_list(check_list, now, &mut on_event);
    }

    /// Runs one scheduling pass over every check list of the session.
    pub fn process_all(&mut self, now: Instant, mut on_event: impl FnMut(IceEvent)) {
        for index in 0..self.streams.len() {
            self.process_check_list(index, now, &mut on_event);
        }
    }

    /// Schedules checks (5.8): pending retransmissions first, then at most
    /// one new check per Ta. A completed list stops emitting ordinary
    /// checks but keeps answering, retransmitting and sending keep-alives.
    fn process_check_list(&mut self, index: usize, now: Instant, on_event: &mut dyn FnMut(IceEvent)) {
        if index >= self.streams.len() {
            return;
        }
        if matches!(
            self.session.state,
            SessionState::Stopped | SessionState::Failed
        ) {
            return;
        }

        let state = self.streams[index].state;
        if state == CheckListState::Failed {
            return;
        }
        if state == CheckListState::Completed {
            self.send_keepalive_packets(index, now, on_event);
        }

        let due: Vec<PairId> = {
            let cl = &self.streams[index];
            cl.check_list
                .iter()
                .copied()
                .filter(|&id| {
                    let p = &cl.pairs[id];
                    p.state == CandidatePairState::InProgress
                        && p.transmission_time.map_or(false, |t| {
                            now.checked_duration_since(t)
                                .map_or(false, |elapsed| elapsed >= p.rto)
                        })
                })
                .collect()
        };
        for id in due {
            log::debug!("retransmitting connectivity check");
            self.send_binding_request(index, id, now, on_event);
        }

        {
            let ta = self.session.ta;
            let cl = &mut self.streams[index];
            if let Some(ta_time) = cl.ta_time {
                let waited = now
                    .checked_duration_since(ta_time)
                    .map_or(true, |elapsed| elapsed < ta);
                if waited {
                    return;
                }
            }
            cl.ta_time = Some(now);
        }

        if let Some(id) = self.streams[index].pop_triggered_check() {
            log::debug!("sending triggered connectivity check");
            self.send_binding_request(index, id, now, on_event);
            return;
        }

        if self.streams[index].state == CheckListState::Running {
            let next = {
                let cl = &self.streams[index];
                cl.check_list
                    .iter()
                    .copied()
                    .find(|&id| cl.pairs[id].state == CandidatePairState::Waiting)
                    .or_else(|| {
                        cl.check_list
                            .iter()
                            .copied()
                            .find(|&id| cl.pairs[id].state == CandidatePairState::Frozen)
                    })
            };
            if let Some(id) = next {
                log::debug!("sending ordinary connectivity check");
                self.send_binding_request(index, id, now, on_event);
                return;
            }
        }

        // nothing left to send; once retransmissions have run dry the check
        // list can be concluded
        let retransmissions_pending = {
            let cl = &self.streams[index];
            cl.check_list.iter().any(|&id| {
                let p = &cl.pairs[id];
                p.state == CandidatePairState::InProgress
                    && p.retransmissions <= MAX_RETRANSMISSIONS
            })
        };
        if !retransmissions_pending {
            self.conclude(index, now, on_event);
            self.update_session_state();
        }
    }

    /// Emits the binding request of a connectivity check for `pair_id`
    /// (7.1.2), driving the retransmission bookkeeping of the pair.
    pub(crate) fn send_binding_request(
        &mut self,
        index: usize,
        pair_id: PairId,
        now: Instant,
        on_event: &mut dyn FnMut(IceEvent),
    ) {
        let role = self.session.role;
        let tie_breaker = self.session.tie_breaker;
        let local_ufrag = self.session.local_ufrag.clone();
        let (remote_ufrag, remote_pwd) = match (
            self.check_list_remote_ufrag(index),
            self.check_list_remote_pwd(index),
        ) {
            (Some(ufrag), Some(pwd)) => (ufrag.to_owned(), pwd.to_owned()),
            _ => {
                log::warn!("cannot send a connectivity check without remote credentials");
                return;
            }
        };

        let cl = &mut self.streams[index];
        let retransmission = cl.pairs[pair_id].state == CandidatePairState::InProgress;
        if retransmission {
            if cl.pairs[pair_id].wait_transaction_timeout {
                // a response arrived for this pair while a triggered check
                // was queued; wait out the transaction and go back to the
                // queue instead of racing it
                cl.pairs[pair_id].wait_transaction_timeout = false;
                cl.pairs[pair_id].set_state(CandidatePairState::Waiting);
                cl.queue_triggered_check(pair_id);
                return;
            }
            let p = &mut cl.pairs[pair_id];
            p.retransmissions += 1;
            if p.retransmissions >= MAX_RETRANSMISSIONS {
                log::debug!("retransmissions exhausted, failing pair");
                p.set_state(CandidatePairState::Failed);
                return;
            }
            p.rto *= 2;
            p.transmission_time = Some(now);
        }

        let (component_id, local_id, remote_id) = {
            let p = &cl.pairs[pair_id];
            (p.component_id, p.local, p.remote)
        };
        if component_id != COMPONENT_RTP && component_id != COMPONENT_RTCP {
            log::warn!("no socket for component {}", component_id);
            return;
        }

        let priority = {
            let local = &cl.local_candidates[local_id];
            prflx_priority(local.local_preference, local.component_id)
        };
        let use_candidate = role == Role::Controlling && cl.pairs[pair_id].is_nominated;
        // a retransmission reuses the transaction id of the in-flight check
        let transaction_id = match cl.pairs[pair_id].transaction_id {
            Some(id) if retransmission => id,
            _ => TransactionId::new(),
        };

        let request = match binding::make_binding_request(
            transaction_id,
            &local_ufrag,
            &remote_ufrag,
            &remote_pwd,
            priority,
            role,
            tie_breaker,
            use_candidate,
        ) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("failed to build binding request: {}", err);
                return;
            }
        };

        let target = match cl.remote_candidates[remote_id].addr.to_socket_addr() {
            Ok(addr) => addr,
            Err(err) => {
                log::warn!("cannot resolve remote candidate address: {}", err);
                return;
            }
        };
        let base_id = cl.local_candidates[local_id].base.unwrap_or(local_id);
        let source = match cl.local_candidates[base_id].addr.to_socket_addr() {
            Ok(addr) => addr,
            Err(err) => {
                log::warn!("cannot resolve local candidate address: {}", err);
                return;
            }
        };

        cl.pairs[pair_id].transaction_id = Some(transaction_id);
        log::trace!(
            "connectivity check for pair {}",
            DisplayPair(
                &cl.local_candidates[local_id],
                &cl.remote_candidates[remote_id]
            )
        );
        on_event(IceEvent::SendData {
            component_id,
            data: request.raw,
            source,
            target,
        });

        if !retransmission {
            // first transmission: arm the retransmission timer and snapshot
            // the role the check was sent under
            let p = &mut cl.pairs[pair_id];
            p.rto = DEFAULT_RTO;
            p.retransmissions = 0;
            p.role = role;
            p.transmission_time = Some(now);
            p.set_state(CandidatePairState::InProgress);
        }
    }

    /// Refreshes the nominated pair of every component with a binding
    /// indication once the keep-alive interval elapsed (10).
    fn send_keepalive_packets(&mut self, index: usize, now: Instant, on_event: &mut dyn FnMut(IceEvent)) {
        let timeout = self.session.keepalive_timeout;
        let cl = &mut self.streams[index];
        let due = cl.keepalive_time.map_or(false, |t| {
            now.checked_duration_since(t)
                .map_or(false, |elapsed| elapsed >= timeout)
        });
        if !due {
            return;
        }

        for i in 0..cl.component_ids.len() {
            let component_id = cl.component_ids[i];
            if component_id != COMPONENT_RTP && component_id != COMPONENT_RTCP {
                continue;
            }
            let valid = match cl.nominated_valid_pair(component_id) {
                Some(vp) => vp.valid,
                None => continue,
            };
            let (local_id, remote_id) = {
                let p = &cl.pairs[valid];
                (p.local, p.remote)
            };
            let target = match cl.remote_candidates[remote_id].addr.to_socket_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    log::warn!("cannot resolve remote candidate address: {}", err);
                    continue;
                }
            };
            let base_id = cl.local_candidates[local_id].base.unwrap_or(local_id);
            let source = match cl.local_candidates[base_id].addr.to_socket_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    log::warn!("cannot resolve local candidate address: {}", err);
                    continue;
                }
            };
            match binding::make_binding_indication() {
                Ok(indication) => {
                    log::debug!("sending keep-alive for component {}", component_id);
                    on_event(IceEvent::SendData {
                        component_id,
                        data: indication.raw,
                        source,
                        target,
                    });
                }
                Err(err) => log::warn!("failed to build binding indication: {}", err),
            }
        }
        cl.keepalive_time = Some(now);
    }
}
