//! Event types published by the engine to host surfaces.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them as JSON unchanged.

pub mod events;
