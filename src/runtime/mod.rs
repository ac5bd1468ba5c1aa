//! Relay runtime: listener, persist stage, and delivery worker.

/// Event stream types emitted by the runtime.
pub mod events;
/// Orchestrator handle, stages, and the startup drain.
pub mod handle;
/// UDP datagram listener.
pub mod listener;
