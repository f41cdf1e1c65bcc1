//! # Summary
//!
//! This module defines the message and identifier types exchanged between
//! Paxos roles (`Ballot`, `Request`, `Proposal`, `PValue`), together with
//! the plain-text wire grammar that carries them between agents. Every
//! line is newline-terminated and whitespace-token-delimited; there is no
//! binary framing anywhere in this crate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::PhysID;

/// A ballot is uniquely determined by its proposer's leader ID and a
/// locally-assigned sequence number. Ballots are compared by `n` first,
/// then by `leader_id`; this total order is what lets acceptors reject
/// stale scouts/commanders and lets leaders detect preemption.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub n: u64,
    pub leader_id: PhysID,
}

impl Ballot {
    pub fn new(n: u64, leader_id: PhysID) -> Self {
        Ballot { n, leader_id }
    }
}

impl PartialOrd for Ballot {
    fn partial_cmp(&self, rhs: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(rhs))
    }
}

impl Ord for Ballot {
    fn cmp(&self, rhs: &Self) -> std::cmp::Ordering {
        (self.n, self.leader_id).cmp(&(rhs.n, rhs.leader_id))
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.leader_id, self.n)
    }
}

/// A client request. Two requests are equal iff all three fields are
/// equal; `(client_id, req_num)` is what the replica keys request
/// de-duplication on, but `payload` is included so that equality also
/// implies identical content, which `PValue`/`Proposal` equality relies
/// on when comparing pvalues returned by different acceptors.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub client_id: PhysID,
    pub req_num: u64,
    pub payload: String,
}

impl Request {
    pub fn new(client_id: PhysID, req_num: u64, payload: impl Into<String>) -> Self {
        Request { client_id, req_num, payload: payload.into() }
    }
}

/// A leader's proposed binding from slot to request, prior to acceptance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proposal {
    pub slot: u64,
    pub request: Request,
}

/// A decided binding from slot to request. Structurally identical to a
/// `Proposal`; kept as a distinct name since the two travel on different
/// wire messages (`p2a`/commander traffic vs. `decision` broadcasts) and
/// mean different things once committed.
pub type Decision = Proposal;

/// An accepted value, tagged with the ballot under which an acceptor
/// accepted it. Scouts collect these from a majority of acceptors to
/// determine what, if anything, was already decided for a slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PValue {
    pub ballot: Ballot,
    pub slot: u64,
    pub request: Request,
}

/// Acceptor's reply to a `p1a`: either the ballot is adopted, or the
/// acceptor's own (higher) ballot is returned so the scout can preempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct P1b {
    pub acceptor_id: PhysID,
    pub ballot: Ballot,
    pub accepted: Vec<PValue>,
}

/// Acceptor's reply to a `p2a`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2b {
    pub acceptor_id: PhysID,
    pub slot: u64,
    pub ballot: Ballot,
}

/// A single peer-to-peer Paxos message, as carried (one per line) on
/// `Port::PEER`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    P1a(Ballot),
    P1b(P1b),
    P2a(PValue),
    P2b(P2b),
    Decision(Decision),
}

/// A command sent to a node's controller agent, as carried on
/// `Port::CONTROL`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Issue(String),
    Dump,
    Skip(u64),
    Kill,
}

/// Errors encountered while parsing a wire line. Carries the offending
/// line so callers can log it without re-threading context.
#[derive(Clone, Debug, thiserror::Error)]
#[error("malformed wire line: {line:?}")]
pub struct ParseError {
    pub line: String,
}

fn fail(line: &str) -> ParseError {
    ParseError { line: line.to_string() }
}

fn token<'a>(fields: &mut std::str::SplitN<'a, char>, line: &str) -> Result<&'a str, ParseError> {
    fields.next().ok_or_else(|| fail(line))
}

fn parse_u64(s: &str, line: &str) -> Result<u64, ParseError> {
    s.parse().map_err(|_| fail(line))
}

fn parse_phys(s: &str, line: &str) -> Result<PhysID, ParseError> {
    s.parse().map_err(|_| fail(line))
}

impl Request {
    /// Formats as `<client_id> <req_num> <payload>`. `payload` is the
    /// remainder of the line and may itself contain whitespace.
    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.client_id, self.req_num, self.payload)
    }

    pub fn parse_line(line: &str) -> Result<Self, ParseError> {
        let mut fields = line.splitn(3, ' ');
        let client_id = parse_phys(token(&mut fields, line)?, line)?;
        let req_num = parse_u64(token(&mut fields, line)?, line)?;
        let payload = token(&mut fields, line)?.to_string();
        Ok(Request { client_id, req_num, payload })
    }
}

/// Formats a committed-request acknowledgement: `committed <client_id> <req_num>`.
pub fn format_committed(client_id: PhysID, req_num: u64) -> String {
    format!("committed {} {}", client_id, req_num)
}

pub fn parse_committed(line: &str) -> Result<(PhysID, u64), ParseError> {
    let mut fields = line.splitn(3, ' ');
    match token(&mut fields, line)? {
        "committed" => {}
        _ => return Err(fail(line)),
    }
    let client_id = parse_phys(token(&mut fields, line)?, line)?;
    let req_num = parse_u64(token(&mut fields, line)?, line)?;
    Ok((client_id, req_num))
}

impl PValue {
    /// Formats the body shared by a standalone `p2a` line and by each
    /// entry of a `p1b`'s `accepted` map: `<bal_leader> <bal_n> <slot>
    /// <client_id> <req_num> <payload>`.
    fn to_body(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.ballot.leader_id,
            self.ballot.n,
            self.slot,
            self.request.client_id,
            format!("{} {}", self.request.req_num, self.request.payload),
        )
    }

    fn parse_body(line: &str) -> Result<Self, ParseError> {
        let mut fields = line.splitn(6, ' ');
        let leader_id = parse_phys(token(&mut fields, line)?, line)?;
        let n = parse_u64(token(&mut fields, line)?, line)?;
        let slot = parse_u64(token(&mut fields, line)?, line)?;
        let client_id = parse_phys(token(&mut fields, line)?, line)?;
        let req_num = parse_u64(token(&mut fields, line)?, line)?;
        let payload = token(&mut fields, line)?.to_string();
        Ok(PValue {
            ballot: Ballot::new(n, leader_id),
            slot,
            request: Request { client_id, req_num, payload },
        })
    }
}

impl PeerMessage {
    pub fn to_line(&self) -> String {
        match self {
            PeerMessage::P1a(ballot) => format!("p1a {}", ballot),
            PeerMessage::P1b(p1b) => {
                let accepted: std::collections::BTreeMap<String, String> = p1b
                    .accepted
                    .iter()
                    .map(|pvalue| (pvalue.slot.to_string(), pvalue.to_body()))
                    .collect();
                let accepted = serde_json::to_string(&accepted).expect("accepted map always serializes");
                format!("p1b {} {} {}", p1b.acceptor_id, p1b.ballot, accepted)
            }
            PeerMessage::P2a(pvalue) => format!("p2a {}", pvalue.to_body()),
            PeerMessage::P2b(p2b) => format!("p2b {} {} {}", p2b.acceptor_id, p2b.slot, p2b.ballot),
            PeerMessage::Decision(decision) => format!(
                "decision {} {} {}",
                decision.slot, decision.request.client_id,
                format!("{} {}", decision.request.req_num, decision.request.payload),
            ),
        }
    }

    pub fn parse_line(line: &str) -> Result<Self, ParseError> {
        let mut fields = line.splitn(2, ' ');
        let tag = token(&mut fields, line)?;
        let rest = fields.next().unwrap_or_default();

        match tag {
            "p1a" => {
                let mut fields = rest.splitn(2, ' ');
                let leader_id = parse_phys(token(&mut fields, line)?, line)?;
                let n = parse_u64(token(&mut fields, line)?, line)?;
                Ok(PeerMessage::P1a(Ballot::new(n, leader_id)))
            }
            "p1b" => {
                let mut fields = rest.splitn(4, ' ');
                let acceptor_id = parse_phys(token(&mut fields, line)?, line)?;
                let bal_leader = parse_phys(token(&mut fields, line)?, line)?;
                let bal_n = parse_u64(token(&mut fields, line)?, line)?;
                let accepted_json = token(&mut fields, line)?;
                let accepted: std::collections::BTreeMap<String, String> =
                    serde_json::from_str(accepted_json).map_err(|_| fail(line))?;
                let accepted = accepted
                    .values()
                    .map(|body| PValue::parse_body(body))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PeerMessage::P1b(P1b {
                    acceptor_id,
                    ballot: Ballot::new(bal_n, bal_leader),
                    accepted,
                }))
            }
            "p2a" => Ok(PeerMessage::P2a(PValue::parse_body(rest)?)),
            "p2b" => {
                let mut fields = rest.splitn(3, ' ');
                let acceptor_id = parse_phys(token(&mut fields, line)?, line)?;
                let slot = parse_u64(token(&mut fields, line)?, line)?;
                let mut bal_fields = token(&mut fields, line)?.splitn(2, ' ');
                let bal_leader_tok = bal_fields.next().ok_or_else(|| fail(line))?;
                let bal_n = parse_u64(bal_fields.next().ok_or_else(|| fail(line))?, line)?;
                let bal_leader = parse_phys(bal_leader_tok, line)?;
                Ok(PeerMessage::P2b(P2b { acceptor_id, slot, ballot: Ballot::new(bal_n, bal_leader) }))
            }
            "decision" => {
                let mut fields = rest.splitn(4, ' ');
                let slot = parse_u64(token(&mut fields, line)?, line)?;
                let client_id = parse_phys(token(&mut fields, line)?, line)?;
                let req_num = parse_u64(token(&mut fields, line)?, line)?;
                let payload = token(&mut fields, line)?.to_string();
                Ok(PeerMessage::Decision(Proposal { slot, request: Request { client_id, req_num, payload } }))
            }
            _ => Err(fail(line)),
        }
    }
}

impl ControlCommand {
    pub fn to_line(&self) -> String {
        match self {
            ControlCommand::Issue(payload) => format!("issue {}", payload),
            ControlCommand::Dump => "dump".to_string(),
            ControlCommand::Skip(slot) => format!("skip {}", slot),
            ControlCommand::Kill => "kill".to_string(),
        }
    }

    pub fn parse_line(line: &str) -> Result<Self, ParseError> {
        let mut fields = line.splitn(2, ' ');
        let tag = token(&mut fields, line)?;
        match tag {
            "issue" => Ok(ControlCommand::Issue(token(&mut fields, line)?.to_string())),
            "dump" => Ok(ControlCommand::Dump),
            "skip" => {
                let slot = parse_u64(token(&mut fields, line)?, line)?;
                Ok(ControlCommand::Skip(slot))
            }
            "kill" => Ok(ControlCommand::Kill),
            _ => Err(fail(line)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn phys(id: u16) -> PhysID {
        PhysID(id)
    }

    #[test]
    fn ballot_orders_by_n_then_leader() {
        let low_n = Ballot::new(1, phys(9));
        let high_n = Ballot::new(2, phys(1));
        assert!(low_n < high_n);

        let same_n_low_leader = Ballot::new(5, phys(1));
        let same_n_high_leader = Ballot::new(5, phys(2));
        assert!(same_n_low_leader < same_n_high_leader);
    }

    #[test]
    fn request_round_trips_through_wire_line() {
        let request = Request::new(phys(3), 42, "hello world");
        let line = request.to_line();
        assert_eq!(Request::parse_line(&line).unwrap(), request);
    }

    #[test]
    fn committed_round_trips() {
        let line = format_committed(phys(7), 11);
        assert_eq!(parse_committed(&line).unwrap(), (phys(7), 11));
    }

    #[test]
    fn p1a_round_trips() {
        let message = PeerMessage::P1a(Ballot::new(3, phys(2)));
        let line = message.to_line();
        assert_eq!(PeerMessage::parse_line(&line).unwrap(), message);
    }

    #[test]
    fn p2a_round_trips_with_spaces_in_payload() {
        let message = PeerMessage::P2a(PValue {
            ballot: Ballot::new(1, phys(1)),
            slot: 4,
            request: Request::new(phys(5), 9, "put a b c"),
        });
        let line = message.to_line();
        assert_eq!(PeerMessage::parse_line(&line).unwrap(), message);
    }

    #[test]
    fn p2b_round_trips() {
        let message = PeerMessage::P2b(P2b { acceptor_id: phys(4), slot: 2, ballot: Ballot::new(6, phys(1)) });
        let line = message.to_line();
        assert_eq!(PeerMessage::parse_line(&line).unwrap(), message);
    }

    #[test]
    fn p1b_round_trips_with_multiple_accepted_values() {
        let message = PeerMessage::P1b(P1b {
            acceptor_id: phys(1),
            ballot: Ballot::new(2, phys(1)),
            accepted: vec![
                PValue { ballot: Ballot::new(1, phys(1)), slot: 1, request: Request::new(phys(2), 1, "a") },
                PValue { ballot: Ballot::new(2, phys(1)), slot: 2, request: Request::new(phys(2), 2, "b c") },
            ],
        });
        let line = message.to_line();
        let parsed = PeerMessage::parse_line(&line).unwrap();
        match (&message, &parsed) {
            (PeerMessage::P1b(expected), PeerMessage::P1b(actual)) => {
                assert_eq!(expected.acceptor_id, actual.acceptor_id);
                assert_eq!(expected.ballot, actual.ballot);
                let mut expected_sorted = expected.accepted.clone();
                let mut actual_sorted = actual.accepted.clone();
                expected_sorted.sort_by_key(|pvalue| pvalue.slot);
                actual_sorted.sort_by_key(|pvalue| pvalue.slot);
                assert_eq!(expected_sorted, actual_sorted);
            }
            _ => panic!("expected P1b"),
        }
    }

    #[test]
    fn decision_round_trips() {
        let message = PeerMessage::Decision(Decision {
            slot: 9,
            request: Request::new(phys(1), 1, "hello"),
        });
        let line = message.to_line();
        assert_eq!(PeerMessage::parse_line(&line).unwrap(), message);
    }

    #[test]
    fn control_commands_round_trip() {
        for command in [
            ControlCommand::Issue("payload text".to_string()),
            ControlCommand::Dump,
            ControlCommand::Skip(3),
            ControlCommand::Kill,
        ] {
            let line = command.to_line();
            assert_eq!(ControlCommand::parse_line(&line).unwrap(), command);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(PeerMessage::parse_line("bogus 1 2 3").is_err());
    }
}
