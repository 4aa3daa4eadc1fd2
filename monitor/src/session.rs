use std::sync::atomic::{AtomicU8, Ordering};

use strum_macros::Display;

/// Lifecycle shared by spy and recorder sessions. Transitions only move
/// forward; a done session is torn down and discarded, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum SessionState {
    #[strum(serialize = "init")]
    Init,
    #[strum(serialize = "running")]
    Running,
    #[strum(serialize = "done")]
    Done,
}

pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> StateCell {
        StateCell(AtomicU8::new(SessionState::Init as u8))
    }

    pub fn get(&self) -> SessionState {
        match self.0.load(Ordering::SeqCst) {
            0 => SessionState::Init,
            1 => SessionState::Running,
            _ => SessionState::Done,
        }
    }

    /// Init -> Running. Fails once the session has moved past Init.
    pub fn mark_running(&self) -> bool {
        self.0
            .compare_exchange(
                SessionState::Init as u8,
                SessionState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Any state -> Done. Returns true on the first transition.
    pub fn mark_done(&self) -> bool {
        self.0.swap(SessionState::Done as u8, Ordering::SeqCst) != SessionState::Done as u8
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
