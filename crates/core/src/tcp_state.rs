#![forbid(unsafe_code)]

//! Per-leg TCP handshake/teardown tracking.
//!
//! A leg is one TCP conversation between two parties. The machine only looks
//! at which party sent the segment (relative to whoever opened the current
//! phase) and at the control bits; sequence numbers are not tracked.

use crate::types::{Action, Side};
use packet_parser::TcpFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    NoConnection,
    OpenSynSent,
    OpenSynAckSent,
    Established,
    CloseFinSent,
    CloseOnlyAckSent,
    CloseFinAckSent,
    Closed,
}

impl TcpState {
    pub fn code(self) -> u8 {
        match self {
            TcpState::NoConnection => 0,
            TcpState::OpenSynSent => 1,
            TcpState::OpenSynAckSent => 2,
            TcpState::Established => 3,
            TcpState::CloseFinSent => 4,
            TcpState::CloseOnlyAckSent => 5,
            TcpState::CloseFinAckSent => 6,
            TcpState::Closed => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => TcpState::NoConnection,
            1 => TcpState::OpenSynSent,
            2 => TcpState::OpenSynAckSent,
            3 => TcpState::Established,
            4 => TcpState::CloseFinSent,
            5 => TcpState::CloseOnlyAckSent,
            6 => TcpState::CloseFinAckSent,
            7 => TcpState::Closed,
            _ => return None,
        })
    }
}

/// Result of feeding one segment to a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: TcpState,
    pub initiator: Side,
    pub action: Action,
}

/// Pure transition function. `source` is the side that sent the segment,
/// `initiator` whoever opened the current phase of the leg.
pub fn transition(state: TcpState, initiator: Side, source: Side, flags: TcpFlags) -> Transition {
    let mut next = Transition {
        state,
        initiator,
        action: Action::Drop,
    };

    // RST tears the leg down from anywhere.
    if flags.contains(TcpFlags::RST) {
        next.state = TcpState::Closed;
        next.action = Action::Accept;
        return next;
    }

    let syn = flags.contains(TcpFlags::SYN);
    let ack = flags.contains(TcpFlags::ACK);
    let fin = flags.contains(TcpFlags::FIN);
    let from_initiator = source == initiator;

    match state {
        TcpState::NoConnection => {
            if from_initiator && syn && !ack {
                next.state = TcpState::OpenSynSent;
                next.action = Action::Accept;
            }
        }
        TcpState::OpenSynSent => {
            if !from_initiator && syn && ack {
                next.state = TcpState::OpenSynAckSent;
                next.action = Action::Accept;
            }
        }
        TcpState::OpenSynAckSent => {
            if from_initiator && ack {
                next.state = TcpState::Established;
                next.action = Action::Accept;
            }
        }
        TcpState::Established => {
            next.action = Action::Accept;
            if fin {
                next.state = TcpState::CloseFinSent;
                next.initiator = source;
            }
        }
        TcpState::CloseFinSent => {
            if !from_initiator {
                if fin && ack {
                    next.state = TcpState::CloseFinAckSent;
                    next.action = Action::Accept;
                } else if ack {
                    next.state = TcpState::CloseOnlyAckSent;
                    next.action = Action::Accept;
                }
            }
        }
        TcpState::CloseOnlyAckSent => {
            next.action = Action::Accept;
            if !from_initiator && fin {
                next.state = TcpState::CloseFinAckSent;
            }
        }
        TcpState::CloseFinAckSent => {
            if from_initiator && ack {
                next.state = TcpState::Closed;
                next.action = Action::Accept;
            }
        }
        TcpState::Closed => {}
    }
    next
}

/// One TCP conversation on a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leg {
    pub initiator: Side,
    pub state: TcpState,
}

impl Leg {
    pub fn new(initiator: Side) -> Self {
        Leg {
            initiator,
            state: TcpState::NoConnection,
        }
    }

    pub fn advance(&mut self, source: Side, flags: TcpFlags) -> Action {
        let next = transition(self.state, self.initiator, source, flags);
        self.state = next.state;
        self.initiator = next.initiator;
        next.action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: Side = Side::Client;
    const S: Side = Side::Server;

    fn f(bits: &[TcpFlags]) -> TcpFlags {
        bits.iter().fold(TcpFlags::empty(), |acc, b| acc | *b)
    }

    #[test]
    fn full_lifecycle() {
        let mut leg = Leg::new(C);
        let steps = [
            (C, f(&[TcpFlags::SYN]), TcpState::OpenSynSent),
            (S, f(&[TcpFlags::SYN, TcpFlags::ACK]), TcpState::OpenSynAckSent),
            (C, f(&[TcpFlags::ACK]), TcpState::Established),
            (S, f(&[TcpFlags::ACK, TcpFlags::PSH]), TcpState::Established),
            (S, f(&[TcpFlags::FIN, TcpFlags::ACK]), TcpState::CloseFinSent),
            (C, f(&[TcpFlags::ACK]), TcpState::CloseOnlyAckSent),
            (S, f(&[TcpFlags::ACK]), TcpState::CloseOnlyAckSent),
            (C, f(&[TcpFlags::FIN, TcpFlags::ACK]), TcpState::CloseFinAckSent),
            (S, f(&[TcpFlags::ACK]), TcpState::Closed),
        ];
        for (source, flags, expected) in steps {
            assert_eq!(leg.advance(source, flags), Action::Accept, "{flags:?}");
            assert_eq!(leg.state, expected);
        }
        // FIN from the server flipped the initiator.
        assert_eq!(leg.initiator, S);
        assert_eq!(leg.advance(C, f(&[TcpFlags::ACK])), Action::Drop);
        assert_eq!(leg.state, TcpState::Closed);
    }

    #[test]
    fn combined_fin_ack_skips_only_ack_state() {
        let t = transition(TcpState::CloseFinSent, C, S, f(&[TcpFlags::FIN, TcpFlags::ACK]));
        assert_eq!(t.state, TcpState::CloseFinAckSent);
        assert_eq!(t.action, Action::Accept);
    }

    #[test]
    fn rst_closes_from_every_state() {
        for code in 0..8 {
            let state = TcpState::from_code(code).unwrap();
            for source in [C, S] {
                let t = transition(state, C, source, TcpFlags::RST);
                assert_eq!(t.state, TcpState::Closed);
                assert_eq!(t.action, Action::Accept);
            }
        }
    }

    #[test]
    fn wrong_direction_is_dropped_without_change() {
        let t = transition(TcpState::NoConnection, C, S, TcpFlags::SYN);
        assert_eq!((t.state, t.action), (TcpState::NoConnection, Action::Drop));

        let t = transition(TcpState::OpenSynSent, C, C, f(&[TcpFlags::SYN, TcpFlags::ACK]));
        assert_eq!((t.state, t.action), (TcpState::OpenSynSent, Action::Drop));

        let t = transition(TcpState::OpenSynAckSent, C, S, TcpFlags::ACK);
        assert_eq!((t.state, t.action), (TcpState::OpenSynAckSent, Action::Drop));

        let t = transition(TcpState::CloseFinSent, C, C, TcpFlags::ACK);
        assert_eq!((t.state, t.action), (TcpState::CloseFinSent, Action::Drop));

        let t = transition(TcpState::CloseFinAckSent, C, S, TcpFlags::ACK);
        assert_eq!((t.state, t.action), (TcpState::CloseFinAckSent, Action::Drop));
    }

    #[test]
    fn handshake_rejects_unexpected_flags() {
        let t = transition(TcpState::NoConnection, C, C, f(&[TcpFlags::SYN, TcpFlags::ACK]));
        assert_eq!(t.action, Action::Drop);
        let t = transition(TcpState::OpenSynSent, C, S, TcpFlags::ACK);
        assert_eq!(t.action, Action::Drop);
        let t = transition(TcpState::OpenSynAckSent, C, C, TcpFlags::PSH);
        assert_eq!(t.action, Action::Drop);
        let t = transition(TcpState::CloseFinSent, C, S, TcpFlags::PSH);
        assert_eq!(t.action, Action::Drop);
    }

    #[test]
    fn established_accepts_anything_and_initiator_moves_on_fin() {
        let t = transition(TcpState::Established, C, S, TcpFlags::SYN);
        assert_eq!((t.state, t.action), (TcpState::Established, Action::Accept));
        let t = transition(TcpState::Established, C, S, TcpFlags::FIN);
        assert_eq!(t.state, TcpState::CloseFinSent);
        assert_eq!(t.initiator, S);
    }

    fn flags_from_bits(bits: u8) -> TcpFlags {
        let mut flags = TcpFlags::empty();
        for (bit, flag) in [(1, TcpFlags::SYN), (2, TcpFlags::ACK), (4, TcpFlags::FIN), (8, TcpFlags::RST)] {
            if bits & bit != 0 {
                flags |= flag;
            }
        }
        flags
    }

    /// Expected (state, action, initiator flipped) written out as a table.
    fn expected(state: TcpState, from_initiator: bool, flags: TcpFlags) -> (TcpState, Action, bool) {
        use Action::{Accept, Drop};
        use TcpState::*;

        if flags.contains(TcpFlags::RST) {
            return (Closed, Accept, false);
        }
        let syn = flags.contains(TcpFlags::SYN);
        let ack = flags.contains(TcpFlags::ACK);
        let fin = flags.contains(TcpFlags::FIN);
        match (state, from_initiator, syn, ack, fin) {
            (NoConnection, true, true, false, _) => (OpenSynSent, Accept, false),
            (OpenSynSent, false, true, true, _) => (OpenSynAckSent, Accept, false),
            (OpenSynAckSent, true, _, true, _) => (Established, Accept, false),
            (Established, from, _, _, true) => (CloseFinSent, Accept, !from),
            (Established, ..) => (Established, Accept, false),
            (CloseFinSent, false, _, true, true) => (CloseFinAckSent, Accept, false),
            (CloseFinSent, false, _, true, false) => (CloseOnlyAckSent, Accept, false),
            (CloseOnlyAckSent, false, _, _, true) => (CloseFinAckSent, Accept, false),
            (CloseOnlyAckSent, ..) => (CloseOnlyAckSent, Accept, false),
            (CloseFinAckSent, true, _, true, _) => (Closed, Accept, false),
            (other, ..) => (other, Drop, false),
        }
    }

    #[test]
    fn every_state_direction_and_flag_combination() {
        for code in 0..8 {
            let state = TcpState::from_code(code).unwrap();
            for source in [C, S] {
                for bits in 0..16 {
                    let flags = flags_from_bits(bits);
                    let (want_state, want_action, flipped) = expected(state, source == C, flags);
                    let t = transition(state, C, source, flags);
                    let ctx = format!("{state:?} from {source:?} with {flags:?}");
                    assert_eq!(t.state, want_state, "{ctx}");
                    assert_eq!(t.action, want_action, "{ctx}");
                    assert_eq!(t.initiator, if flipped { S } else { C }, "{ctx}");
                }
            }
        }
    }

    #[test]
    fn replaying_a_sequence_gives_identical_results() {
        // Fixed pseudo-random walk over sources and flag combinations.
        let mut seed: u32 = 0x1234_5678;
        let sequence: Vec<(Side, TcpFlags)> = (0..200)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                let source = if seed & 0x100 == 0 { C } else { S };
                (source, flags_from_bits(((seed >> 16) % 16) as u8))
            })
            .collect();

        let run = || {
            let mut leg = Leg::new(C);
            sequence
                .iter()
                .map(|(source, flags)| {
                    let action = leg.advance(*source, *flags);
                    (leg.state, leg.initiator, action)
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    fn established() -> Leg {
        let mut leg = Leg::new(C);
        leg.advance(C, TcpFlags::SYN);
        leg.advance(S, f(&[TcpFlags::SYN, TcpFlags::ACK]));
        leg.advance(C, TcpFlags::ACK);
        assert_eq!(leg.state, TcpState::Established);
        leg
    }

    /// Client sends `fin`, then `replies` must close the leg in at most
    /// three accepted segments.
    fn client_close(fin: TcpFlags, replies: &[(Side, TcpFlags)]) {
        let mut leg = established();
        assert_eq!(leg.advance(C, fin), Action::Accept);
        assert_eq!((leg.state, leg.initiator), (TcpState::CloseFinSent, C));

        let mut accepted = 0;
        for (source, flags) in replies {
            assert_eq!(leg.advance(*source, *flags), Action::Accept, "{flags:?}");
            accepted += 1;
        }
        assert_eq!(leg.state, TcpState::Closed);
        assert!(accepted <= 3, "closed after {accepted} segments");
        // Nothing gets through once closed.
        assert_eq!(leg.advance(S, TcpFlags::ACK), Action::Drop);
    }

    #[test]
    fn client_close_with_separate_ack_and_fin() {
        client_close(
            TcpFlags::FIN,
            &[(S, TcpFlags::ACK), (S, TcpFlags::FIN), (C, TcpFlags::ACK)],
        );
    }

    #[test]
    fn client_close_with_combined_fin_ack() {
        client_close(
            f(&[TcpFlags::FIN, TcpFlags::ACK]),
            &[(S, f(&[TcpFlags::FIN, TcpFlags::ACK])), (C, TcpFlags::ACK)],
        );
    }

    #[test]
    fn state_codes_roundtrip() {
        for code in 0..8 {
            assert_eq!(TcpState::from_code(code).map(TcpState::code), Some(code));
        }
        assert_eq!(TcpState::from_code(8), None);
    }
}
