use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use stun::agent::TransactionId;
use stun::message::{Message, CLASS_INDICATION};

use super::*;
use crate::binding;
use crate::candidate::{CandidatePairState, CandidateType, TransportAddress, COMPONENT_RTCP, COMPONENT_RTP};
use crate::check_list::CheckListState;
use crate::error::Result;

const UFRAG_A: &str = "aaaaaaaa";
const PWD_A: &str = "bbbbbbbbbbbbbbbbbbbbbbbb";
const UFRAG_B: &str = "cccccccc";
const PWD_B: &str = "dddddddddddddddddddddddd";

const TA: Duration = Duration::from_millis(20);

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn make_agent(role: Role, ufrag: &str, pwd: &str, remote_ufrag: &str, remote_pwd: &str) -> Agent {
    let mut agent = Agent::new(AgentConfig {
        role,
        local_ufrag: ufrag.to_owned(),
        local_pwd: pwd.to_owned(),
        ..AgentConfig::default()
    })
    .unwrap();
    agent
        .set_remote_credentials(remote_ufrag, remote_pwd)
        .unwrap();
    agent.add_check_list();
    agent
}

/// One side of an in-memory loopback link: the agent plus the sockets the
/// host layer would own for it.
struct Endpoint {
    agent: Agent,
    sockets: HashMap<SocketAddr, u16>,
    completed: Vec<usize>,
}

impl Endpoint {
    fn new(agent: Agent) -> Self {
        Self {
            agent,
            sockets: HashMap::new(),
            completed: Vec::new(),
        }
    }

    fn add_host(&mut self, component_id: u16, addr: &str) {
        let sa: SocketAddr = addr.parse().unwrap();
        self.agent
            .check_list_mut(0)
            .unwrap()
            .add_local_candidate(
                CandidateType::Host,
                component_id,
                TransportAddress::from(sa),
                None,
            )
            .unwrap();
        self.sockets.insert(sa, component_id);
    }

    fn check_list_state(&self) -> CheckListState {
        self.agent.check_list(0).unwrap().state()
    }
}

fn exchange_candidates(a: &mut Endpoint, b: &mut Endpoint) {
    for c in a.agent.get_local_candidates_stats(0) {
        b.agent
            .check_list_mut(0)
            .unwrap()
            .add_remote_candidate(
                c.candidate_type,
                c.component_id,
                c.addr,
                c.priority,
                &c.foundation,
            )
            .unwrap();
    }
    for c in b.agent.get_local_candidates_stats(0) {
        a.agent
            .check_list_mut(0)
            .unwrap()
            .add_remote_candidate(
                c.candidate_type,
                c.component_id,
                c.addr,
                c.priority,
                &c.foundation,
            )
            .unwrap();
    }
}

fn deliver(to: &mut Endpoint, out: &mut Vec<IceEvent>, data: Vec<u8>, source: SocketAddr, target: SocketAddr, now: Instant) {
    let component_id = match to.sockets.get(&target) {
        Some(&component_id) => component_id,
        None => return,
    };
    let pkt = ReceivedPacket {
        data,
        source,
        destination: target,
        component_id,
    };
    to.agent.handle_packet(0, &pkt, now, |e| out.push(e));
}

/// Runs one Ta tick on both agents and shuttles packets between them until
/// the link is quiet.
fn run_tick(a: &mut Endpoint, b: &mut Endpoint, now: Instant) {
    let mut a_out: Vec<IceEvent> = Vec::new();
    let mut b_out: Vec<IceEvent> = Vec::new();
    a.agent.process(0, now, |e| a_out.push(e));
    b.agent.process(0, now, |e| b_out.push(e));

    while !a_out.is_empty() || !b_out.is_empty() {
        for event in std::mem::take(&mut a_out) {
            match event {
                IceEvent::SendData {
                    data,
                    source,
                    target,
                    ..
                } => deliver(b, &mut b_out, data, source, target, now),
                IceEvent::CheckListCompleted { check_list } => a.completed.push(check_list),
            }
        }
        for event in std::mem::take(&mut b_out) {
            match event {
                IceEvent::SendData {
                    data,
                    source,
                    target,
                    ..
                } => deliver(a, &mut a_out, data, source, target, now),
                IceEvent::CheckListCompleted { check_list } => b.completed.push(check_list),
            }
        }
    }
}

fn run_until_completed(a: &mut Endpoint, b: &mut Endpoint, start: Instant, max_ticks: u32) -> Instant {
    let mut now = start;
    for _ in 0..max_ticks {
        run_tick(a, b, now);
        if a.check_list_state() == CheckListState::Completed
            && b.check_list_state() == CheckListState::Completed
        {
            return now;
        }
        now += TA;
    }
    panic!(
        "agents did not complete, a={:?} b={:?}",
        a.check_list_state(),
        b.check_list_state()
    );
}

#[test]
fn test_host_host_two_components() {
    init_log();
    let mut a = Endpoint::new(make_agent(Role::Controlling, UFRAG_A, PWD_A, UFRAG_B, PWD_B));
    let mut b = Endpoint::new(make_agent(Role::Controlled, UFRAG_B, PWD_B, UFRAG_A, PWD_A));

    a.add_host(COMPONENT_RTP, "10.0.0.1:5000");
    a.add_host(COMPONENT_RTCP, "10.0.0.1:5001");
    b.add_host(COMPONENT_RTP, "10.0.0.2:6000");
    b.add_host(COMPONENT_RTCP, "10.0.0.2:6001");
    a.agent.compute_foundations();
    b.agent.compute_foundations();
    exchange_candidates(&mut a, &mut b);

    a.agent.pair_candidates();
    b.agent.pair_candidates();
    assert_eq!(a.agent.state(), SessionState::Running);
    assert_eq!(a.agent.get_candidate_pairs_stats(0).len(), 2);

    run_until_completed(&mut a, &mut b, Instant::now(), 20);

    assert_eq!(a.agent.state(), SessionState::Completed);
    assert_eq!(b.agent.state(), SessionState::Completed);
    // the success notification fires exactly once per check list
    assert_eq!(a.completed, vec![0]);
    assert_eq!(b.completed, vec![0]);

    let selected = a
        .agent
        .check_list(0)
        .unwrap()
        .selected_remote_addresses()
        .unwrap();
    assert_eq!(selected.addr, "10.0.0.2");
    assert_eq!(selected.rtp_port, 6000);
    assert_eq!(selected.rtcp_port, Some(6001));

    let selected = b
        .agent
        .check_list(0)
        .unwrap()
        .selected_remote_addresses()
        .unwrap();
    assert_eq!(selected.addr, "10.0.0.1");
    assert_eq!(selected.rtp_port, 5000);
    assert_eq!(selected.rtcp_port, Some(5001));
}

#[test]
fn test_role_conflict_resolution() {
    init_log();
    // both sides start controlling; the lesser tie-breaker yields
    let mut a = Endpoint::new(make_agent(Role::Controlling, UFRAG_A, PWD_A, UFRAG_B, PWD_B));
    let mut b = Endpoint::new(make_agent(Role::Controlling, UFRAG_B, PWD_B, UFRAG_A, PWD_A));
    a.agent.set_tie_breaker(10);
    b.agent.set_tie_breaker(20);

    a.add_host(COMPONENT_RTP, "10.0.0.1:5000");
    b.add_host(COMPONENT_RTP, "10.0.0.2:6000");
    a.agent.compute_foundations();
    b.agent.compute_foundations();
    exchange_candidates(&mut a, &mut b);
    a.agent.pair_candidates();
    b.agent.pair_candidates();

    run_until_completed(&mut a, &mut b, Instant::now(), 20);

    assert_eq!(a.agent.role(), Role::Controlled);
    assert_eq!(b.agent.role(), Role::Controlling);
}

#[test]
fn test_peer_reflexive_learning() -> Result<()> {
    let mut y = make_agent(Role::Controlled, UFRAG_B, PWD_B, UFRAG_A, PWD_A);
    {
        let cl = y.check_list_mut(0).unwrap();
        cl.add_local_candidate(
            CandidateType::Host,
            COMPONENT_RTP,
            TransportAddress::new("10.0.0.2", 6000),
            None,
        )?;
        // the peer signaled its private host address
        cl.add_remote_candidate(
            CandidateType::Host,
            COMPONENT_RTP,
            TransportAddress::new("192.168.1.2", 5000),
            0,
            "1",
        )?;
    }
    y.compute_foundations();
    y.pair_candidates();

    // the check arrives from the NAT-rewritten address instead
    let request = binding::make_binding_request(
        TransactionId::new(),
        UFRAG_A,
        UFRAG_B,
        PWD_B,
        0x1234_5678,
        Role::Controlling,
        7,
        false,
    )?;
    let source: SocketAddr = "203.0.113.5:40000".parse().unwrap();
    let destination: SocketAddr = "10.0.0.2:6000".parse().unwrap();
    let mut events = Vec::new();
    y.handle_packet(
        0,
        &ReceivedPacket {
            data: request.raw,
            source,
            destination,
            component_id: COMPONENT_RTP,
        },
        Instant::now(),
        |e| events.push(e),
    );

    let remotes = y.get_remote_candidates_stats(0);
    let prflx = remotes
        .iter()
        .find(|c| c.candidate_type == CandidateType::PeerReflexive)
        .expect("peer reflexive candidate should be learned");
    assert_eq!(prflx.addr, TransportAddress::new("203.0.113.5", 40000));
    assert_eq!(prflx.priority, 0x1234_5678);
    assert!(!prflx.foundation.is_empty());

    // the new pair is waiting on the triggered-check queue
    let pairs = y.get_candidate_pairs_stats(0);
    assert!(pairs
        .iter()
        .any(|p| p.remote.addr == prflx.addr && p.state == CandidatePairState::Waiting));

    // and the check itself was answered
    assert!(matches!(
        events.first(),
        Some(IceEvent::SendData { target, .. }) if *target == source
    ));

    Ok(())
}

#[test]
fn test_retransmission_exhaustion() {
    // the peer never answers; the pair must fail after the RTO schedule
    // 100 + 200 + 400 + 800 + 1600 + 3200 + 6400 = 12700 ms runs dry
    let mut a = make_agent(Role::Controlling, UFRAG_A, PWD_A, UFRAG_B, PWD_B);
    {
        let cl = a.check_list_mut(0).unwrap();
        cl.add_local_candidate(
            CandidateType::Host,
            COMPONENT_RTP,
            TransportAddress::new("10.0.0.1", 5000),
            None,
        )
        .unwrap();
        cl.add_remote_candidate(
            CandidateType::Host,
            COMPONENT_RTP,
            TransportAddress::new("10.0.0.2", 6000),
            0,
            "1",
        )
        .unwrap();
    }
    a.compute_foundations();
    a.pair_candidates();

    let t0 = Instant::now();
    let mut now = t0;
    let mut sent = 0u32;
    let mut failed_after = None;
    while now < t0 + Duration::from_secs(13) {
        a.process(0, now, |e| {
            if let IceEvent::SendData { .. } = e {
                sent += 1;
            }
        });
        if failed_after.is_none()
            && a.get_candidate_pairs_stats(0)[0].state == CandidatePairState::Failed
        {
            failed_after = Some(now - t0);
        }
        now += TA;
    }

    let failed_after = failed_after.expect("pair should have failed");
    assert!(failed_after >= Duration::from_millis(12700), "{:?}", failed_after);
    assert!(failed_after < Duration::from_millis(12800), "{:?}", failed_after);
    // the initial transmission plus six retransmissions went out
    assert_eq!(sent, 7);
    assert_eq!(a.check_list(0).unwrap().state(), CheckListState::Failed);
    assert_eq!(a.state(), SessionState::Failed);
}

#[test]
fn test_keepalive_indications() {
    let mut a = Endpoint::new(make_agent(Role::Controlling, UFRAG_A, PWD_A, UFRAG_B, PWD_B));
    let mut b = Endpoint::new(make_agent(Role::Controlled, UFRAG_B, PWD_B, UFRAG_A, PWD_A));
    a.add_host(COMPONENT_RTP, "10.0.0.1:5000");
    a.add_host(COMPONENT_RTCP, "10.0.0.1:5001");
    b.add_host(COMPONENT_RTP, "10.0.0.2:6000");
    b.add_host(COMPONENT_RTCP, "10.0.0.2:6001");
    a.agent.compute_foundations();
    b.agent.compute_foundations();
    exchange_candidates(&mut a, &mut b);
    a.agent.pair_candidates();
    b.agent.pair_candidates();

    let completed_at = run_until_completed(&mut a, &mut b, Instant::now(), 20);

    let count_indications = |events: &[IceEvent]| {
        events
            .iter()
            .filter(|e| match e {
                IceEvent::SendData { data, .. } => {
                    let mut msg = Message::new();
                    msg.write(data).unwrap();
                    msg.typ.class == CLASS_INDICATION
                }
                _ => false,
            })
            .count()
    };

    // just before the keep-alive interval nothing is emitted
    let mut events = Vec::new();
    a.agent
        .process(0, completed_at + Duration::from_secs(14), |e| events.push(e));
    assert_eq!(count_indications(&events), 0);

    // one indication per component at +15 s, and again at +30 s
    let mut events = Vec::new();
    a.agent
        .process(0, completed_at + Duration::from_secs(15), |e| events.push(e));
    assert_eq!(count_indications(&events), 2);

    let mut events = Vec::new();
    a.agent
        .process(0, completed_at + Duration::from_secs(30), |e| events.push(e));
    assert_eq!(count_indications(&events), 2);
}

#[test]
fn test_conclude_twice_is_noop() {
    let mut a = Endpoint::new(make_agent(Role::Controlling, UFRAG_A, PWD_A, UFRAG_B, PWD_B));
    let mut b = Endpoint::new(make_agent(Role::Controlled, UFRAG_B, PWD_B, UFRAG_A, PWD_A));
    a.add_host(COMPONENT_RTP, "10.0.0.1:5000");
    b.add_host(COMPONENT_RTP, "10.0.0.2:6000");
    a.agent.compute_foundations();
    b.agent.compute_foundations();
    exchange_candidates(&mut a, &mut b);
    a.agent.pair_candidates();
    b.agent.pair_candidates();

    let completed_at = run_until_completed(&mut a, &mut b, Instant::now(), 20);

    let before = serde_json::to_string(&a.agent.get_check_list_stats(0).unwrap()).unwrap();
    let mut events = Vec::new();
    a.agent.conclude(0, completed_at, &mut |e| events.push(e));
    let after = serde_json::to_string(&a.agent.get_check_list_stats(0).unwrap()).unwrap();

    assert!(events.is_empty(), "conclusion must not re-fire events");
    assert_eq!(before, after);
}

#[test]
fn test_set_role_same_value_keeps_priorities() {
    let mut a = make_agent(Role::Controlling, UFRAG_A, PWD_A, UFRAG_B, PWD_B);
    {
        let cl = a.check_list_mut(0).unwrap();
        cl.add_local_candidate(
            CandidateType::Host,
            COMPONENT_RTP,
            TransportAddress::new("10.0.0.1", 5000),
            None,
        )
        .unwrap();
        cl.add_remote_candidate(
            CandidateType::Host,
            COMPONENT_RTP,
            TransportAddress::new("10.0.0.2", 6000),
            1000,
            "1",
        )
        .unwrap();
    }
    a.compute_foundations();
    a.pair_candidates();

    let before = serde_json::to_string(&a.get_check_list_stats(0).unwrap()).unwrap();
    a.set_role(Role::Controlling);
    let unchanged = serde_json::to_string(&a.get_check_list_stats(0).unwrap()).unwrap();
    assert_eq!(before, unchanged);

    a.set_role(Role::Controlled);
    let changed = serde_json::to_string(&a.get_check_list_stats(0).unwrap()).unwrap();
    assert_ne!(before, changed);
}

#[test]
fn test_generated_credentials_shape() {
    let agent = Agent::new(AgentConfig::default()).unwrap();
    assert_eq!(agent.local_ufrag().len(), 8);
    assert_eq!(agent.local_pwd().len(), 24);
    assert!(agent.remote_ufrag().is_none());

    let err = Agent::new(AgentConfig {
        local_ufrag: "ab".to_owned(),
        ..AgentConfig::default()
    })
    .unwrap_err();
    assert_eq!(err, crate::Error::ErrLocalUfragInsufficientBits);

    let err = Agent::new(AgentConfig {
        local_pwd: "short".to_owned(),
        ..AgentConfig::default()
    })
    .unwrap_err();
    assert_eq!(err, crate::Error::ErrLocalPwdInsufficientBits);
}

#[test]
fn test_keepalive_timeout_clamped() {
    let mut agent = Agent::new(AgentConfig::default()).unwrap();
    agent.set_keepalive_timeout(Duration::from_secs(5));
    assert_eq!(agent.session.keepalive_timeout, Duration::from_secs(15));
    agent.set_keepalive_timeout(Duration::from_secs(30));
    assert_eq!(agent.session.keepalive_timeout, Duration::from_secs(30));
}
