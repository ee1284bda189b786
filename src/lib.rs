//! Workspace umbrella crate.
//!
//! The server itself lives in `services/server`; shared media types in
//! `crates/lg-media`. This crate exists to host the cross-subsystem
//! integration suites under `tests/integration/`.
