pub mod actions;
pub mod applier;
pub mod helpers;
pub mod preflight;
pub mod reconciler;
pub mod restart;
pub mod state_machine;
pub mod status;
