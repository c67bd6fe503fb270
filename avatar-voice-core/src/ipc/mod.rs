//! Event types broadcast to host applications.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! forward them verbatim as JSON.

pub mod events;
