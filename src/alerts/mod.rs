/// Alert state machine and its escalating debounce window
pub mod backoff;
pub mod state_machine;

pub use backoff::{Backoff, MAX_BACKOFF};
pub use state_machine::{AlertStateMachine, MountErrorState};
