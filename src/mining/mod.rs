//! Background mining
//!
//! The nonce search itself lives in `core::proof_of_work`; this module runs
//! it on a dedicated thread and hands results back to whoever owns the chain.

pub mod worker;

pub use worker::{MiningBackend, MiningJob, MiningWorker};
