//! Agent presence and the per-agent FSM.

pub mod presence;
pub mod state_machine;

pub use presence::PresenceRegistry;
pub use state_machine::AgentStateMachine;
