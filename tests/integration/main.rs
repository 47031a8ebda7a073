//! Integration tests driving the reconciler against in-memory fakes, plus
//! the kube-backed cluster access and revision store against an envtest API
//! server (`kube_backed`).
//!
//! Each submodule tests a specific area of concern. The shared harness and
//! helpers live in `common.rs`.
//!
//! Run with: `cargo test --test integration`

mod common;

mod actions;
mod applier;
mod reconcile;
mod revision_store;
