//! Small filesystem helpers shared by the engine.

pub mod atomic;
