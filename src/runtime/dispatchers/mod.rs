//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: processes orchestration turns
//! - `worker`: executes activities

mod orchestration;
mod worker;
