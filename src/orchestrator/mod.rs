//! Application-level orchestration.
//!
//! The controller owns the active run and routes driver events through the
//! reconciler into the store. CLI layers call into this module and render the
//! resulting records; they never touch drivers directly.

mod controller;

pub(crate) use controller::RunController;
