//! Role state machines.
//!
//! Clients and trustees share one state alphabet; the relay has its own
//! phase cycle. Every transition is logged, and handlers reject messages
//! that arrive out of phase instead of acting on them.

use tracing::{debug, warn};

use crate::Error;

/// Client/trustee protocol states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    BeforeInit,
    Initializing,
    EphKeysSent,
    Ready,
    Blaming,
    Shutdown,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::BeforeInit => "BEFORE_INIT",
            State::Initializing => "INITIALIZING",
            State::EphKeysSent => "EPH_KEYS_SENT",
            State::Ready => "READY",
            State::Blaming => "BLAMING",
            State::Shutdown => "SHUTDOWN",
        }
    }
}

/// Relay phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayPhase {
    Init,
    Setup,
    MainLoop,
    Blaming,
    Resync,
    Shutdown,
}

impl RelayPhase {
    pub fn name(&self) -> &'static str {
        match self {
            RelayPhase::Init => "INIT",
            RelayPhase::Setup => "SETUP",
            RelayPhase::MainLoop => "MAIN_LOOP",
            RelayPhase::Blaming => "BLAMING",
            RelayPhase::Resync => "RESYNC",
            RelayPhase::Shutdown => "SHUTDOWN",
        }
    }
}

/// A logged state holder for clients and trustees.
#[derive(Debug)]
pub struct StateMachine {
    entity: String,
    state: State,
}

impl StateMachine {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            state: State::BeforeInit,
        }
    }

    pub fn current(&self) -> State {
        self.state
    }

    pub fn set_entity(&mut self, entity: impl Into<String>) {
        self.entity = entity.into();
    }

    /// Moves to `next`, logging the transition.
    pub fn transition(&mut self, next: State) {
        debug!(
            entity = %self.entity,
            from = self.state.name(),
            to = next.name(),
            "state change"
        );
        self.state = next;
    }

    /// Checks that the current state is one of `allowed` before handling
    /// `message`; logs and returns an error otherwise.
    pub fn expect(&self, allowed: &[State], message: &'static str) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        warn!(
            entity = %self.entity,
            state = self.state.name(),
            message,
            "out-of-phase message dropped"
        );
        Err(Error::OutOfPhase {
            message,
            state: self.state.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_and_guards() {
        let mut machine = StateMachine::new("client-0");
        assert_eq!(machine.current(), State::BeforeInit);

        machine.transition(State::Initializing);
        assert_eq!(machine.current(), State::Initializing);

        assert!(machine
            .expect(&[State::Initializing, State::Ready], "TEST")
            .is_ok());
        let err = machine.expect(&[State::Ready], "TEST").unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfPhase {
                message: "TEST",
                state: "INITIALIZING"
            }
        ));
    }
}
