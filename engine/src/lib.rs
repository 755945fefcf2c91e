//! The Voteflow delivery engine: every tier of the reliable ballot
//! pipeline as a library, consumed by the `voteflow-station`,
//! `voteflow-broker` and `voteflow-central` binaries and by the
//! integration tests.

pub mod broker;
pub mod central;
pub mod rpc;
pub mod settings;
pub mod station;
pub mod store;
