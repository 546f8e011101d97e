//! In-memory provider adapters for fast testing and single-process use
//!
//! One adapter per capability, all backed by shared `Arc` state so clones
//! observe the same data, plus a [`MemFaults`] switchboard for scripting
//! connectivity loss, probe/operation failures and injected latency from
//! tests.

pub mod adapter;

pub use adapter::{
    MemAuth, MemDatabase, MemFaults, MemFunctions, MemObjectStore, MemRealtime,
};
