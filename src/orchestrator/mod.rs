//! Session and fleet orchestration.
//!
//! Local side: process signalling, the session manager, and git
//! checkpoints. Fleet side: branch layout, execution spawners, and the
//! dispatch loop.

pub mod branching;
pub mod checkpoint_manager;
pub mod dispatch;
pub mod process;
pub mod session_manager;
pub mod spawner;
