//! Workspace-level acceptance tests.
//!
//! Each test spawns a [`s7_link::ConnectionManager`] over a
//! [`s7_link::SimulatedTransport`] and checks the observable transport
//! call log, so timing is asserted without touching a real PLC.

mod close_test;
mod common;
mod scenario_test;
