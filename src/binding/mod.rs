
use std::net::SocketAddr;

use stun::agent::TransactionId;
use stun::attributes::ATTR_USERNAME;
use stun::error_code::{ErrorCode, ErrorCodeAttribute};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::{TextAttribute, Username};
use stun::xoraddr::XorMappedAddress;

use crate::control::Role;
use crate::error::{Error, Result};
use crate::priority::PriorityAttr;
use crate::use_candidate::UseCandidateAttr;

/// Builds the binding request for a connectivity check (7.1.2).
///
/// The message authenticates with the peer's password, carries the
/// tie-breaker under the attribute matching `role`, and carries
/// USE-CANDIDATE only for a nominating check sent by the controlling agent.
#[allow(clippy::too_many_arguments)]
pub fn make_binding_request(
    transaction_id: TransactionId,
    local_ufrag: &str,
    remote_ufrag: &str,
    remote_pwd: &str,
    priority: u32,
    role: Role,
    tie_breaker: u64,
    use_candidate: bool,
) -> Result<Message> {
    let username = format!("{}:{}", remote_ufrag, local_ufrag);

    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(BINDING_REQUEST),
        Box::new(transaction_id),
        Box::new(Username::new(ATTR_USERNAME, username)),
        Box::new(PriorityAttr(priority)),
        role.to_attr(tie_breaker),
    ];
    if use_candidate {
        setters.push(Box::new(UseCandidateAttr::new()));
    }
    setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
        remote_pwd.to_owned(),
    )));
    setters.push(Box::new(FINGERPRINT));

    let mut msg = Message::new();
    msg.build(&setters)?;
    Ok(msg)
}

/// Builds the success response to a binding request (7.2.1.6): same
/// transaction id, USERNAME echoed from the request, and the source the
/// request arrived from reflected in XOR-MAPPED-ADDRESS.
pub fn make_binding_success(
    request: &Message,
    source: SocketAddr,
    local_pwd: &str,
) -> Result<Message> {
    let username = TextAttribute::get_from_as(request, ATTR_USERNAME)?;

    let mut msg = Message::new();
    msg.build(&[
        Box::new(request.clone()),
        Box::new(BINDING_SUCCESS),
        Box::new(username),
        Box::new(XorMappedAddress {
            ip: source.ip(),
            port: source.port(),
        }),
        Box::new(MessageIntegrity::new_short_term_integrity(
            local_pwd.to_owned(),
        )),
        Box::new(FINGERPRINT),
    ])?;
    Ok(msg)
}

/// Builds an error response echoing the request's transaction id.
pub fn make_binding_error(request: &Message, code: ErrorCode, reason: &str) -> Result<Message> {
    let mut msg = Message::new();
    msg.build(&[
        Box::new(request.clone()),
        Box::new(BINDING_ERROR),
        Box::new(ErrorCodeAttribute {
            code,
            reason: reason.as_bytes().to_vec(),
        }),
        Box::new(FINGERPRINT),
    ])?;
    Ok(msg)
}

/// Builds the minimal binding indication used as a keep-alive (10).
pub fn make_binding_indication() -> Result<Message> {
    let mut msg = Message::new();
    msg.build(&[
        Box::new(MessageType::new(METHOD_BINDING, CLASS_INDICATION)),
        Box::new(TransactionId::new()),
        Box::new(FINGERPRINT),
    ])?;
    Ok(msg)
}

/// Verifies the short-term MESSAGE-INTEGRITY of an inbound message.
///
/// The HMAC covers the message with its length rewritten to exclude the
/// attributes that follow MESSAGE-INTEGRITY (FINGERPRINT in particular);
/// the codec restores the length afterwards.
pub fn verify_integrity(m: &mut Message, pwd: &str) -> Result<()> {
    let integrity = MessageIntegrity::new_short_term_integrity(pwd.to_owned());
    Ok(integrity.check(m)?)
}

/// Verifies the FINGERPRINT of an inbound message.
pub fn verify_fingerprint(m: &Message) -> Result<()> {
    Ok(FINGERPRINT.check(m)?)
}

/// Verifies that the part of USERNAME before the first colon names this
/// agent's user fragment (7.2).
pub fn verify_username(m: &Message, local_ufrag: &str) -> Result<()> {
    let username = TextAttribute::get_from_as(m, ATTR_USERNAME)?;
    match username.text.find(':') {
        Some(colon) if &username.text[..colon] == local_ufrag => Ok(()),
        _ => Err(Error::ErrMismatchUsername),
    }
}
