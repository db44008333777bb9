//! C6 - Call state machine: the per-stream FSM described in §4.6.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    SendMeta,
    RecvMeta,
    SendData,
    RecvData,
    FinishSend,
    RecvEos,
    SendTrailer,
    RecvTrailer,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmError {
    pub phase: Phase,
    pub event: Event,
}

impl fmt::Display for FsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal event {:?} in phase {:?}", self.event, self.phase)
    }
}

impl std::error::Error for FsmError {}

/// Apply `event` to `phase`, returning the new phase or the illegal-transition error.
/// Per §4.6, a stream that suffers an illegal transition is force-closed by the caller
/// of this function (it does not self-heal).
pub fn transition(phase: Phase, event: Event) -> Result<Phase, FsmError> {
    use Event::*;
    use Phase::*;

    if event == Cancel {
        return Ok(Closed);
    }

    let next = match (phase, event) {
        (Idle, SendMeta) => Open,
        (Idle, RecvMeta) => Open,

        (Open, SendData) => Open,
        (Open, RecvData) => Open,
        (Open, FinishSend) => HalfClosedLocal,
        (Open, RecvEos) => HalfClosedRemote,
        // Trailer received while local send is still open: caller was interrupted
        // early by the responder; auto half-close local and fall straight to closed.
        (Open, RecvTrailer) => Closed,
        (Open, SendTrailer) => Closed,

        (HalfClosedLocal, RecvData) => HalfClosedLocal,
        (HalfClosedLocal, RecvEos) => Closed,
        (HalfClosedLocal, RecvTrailer) => Closed,

        (HalfClosedRemote, SendData) => HalfClosedRemote,
        (HalfClosedRemote, FinishSend) => Closed,
        (HalfClosedRemote, SendTrailer) => Closed,

        // Both sides signaling end-of-stream concurrently collapses cleanly.
        (HalfClosedLocal, FinishSend) => HalfClosedLocal,
        (HalfClosedRemote, RecvEos) => HalfClosedRemote,

        (Closed, _) => Closed,

        _ => return Err(FsmError { phase, event }),
    };

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unary_caller_happy_path() {
        let mut phase = Phase::Idle;
        phase = transition(phase, Event::SendMeta).unwrap();
        assert_eq!(phase, Phase::Open);
        phase = transition(phase, Event::SendData).unwrap();
        phase = transition(phase, Event::FinishSend).unwrap();
        assert_eq!(phase, Phase::HalfClosedLocal);
        phase = transition(phase, Event::RecvData).unwrap();
        phase = transition(phase, Event::RecvTrailer).unwrap();
        assert_eq!(phase, Phase::Closed);
    }

    #[test]
    fn closed_is_terminal() {
        let phase = transition(Phase::Closed, Event::SendData).unwrap();
        assert_eq!(phase, Phase::Closed);
    }

    #[test]
    fn cancel_from_any_state_closes() {
        for phase in [Phase::Idle, Phase::Open, Phase::HalfClosedLocal, Phase::HalfClosedRemote] {
            assert_eq!(transition(phase, Event::Cancel).unwrap(), Phase::Closed);
        }
    }

    #[test]
    fn illegal_transition_is_rejected() {
        assert!(transition(Phase::Idle, Event::SendData).is_err());
    }
}
