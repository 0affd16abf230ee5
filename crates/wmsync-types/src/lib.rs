//! Shared wmsync model types.
//!
//! Dependency-light so the state backends, the engine and the CLI can all
//! share them.

pub mod alert;
pub mod record;
pub mod run;
pub mod state;
pub mod validation;
pub mod wire;
