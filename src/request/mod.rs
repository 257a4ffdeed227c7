// src/request/mod.rs
// =============================================================================
// The two values that flow through the engine:
// - Request: one fetch unit, before and during dispatch
// - Response: its successful outcome
// =============================================================================

mod response;
mod unit;

pub use response::Response;
pub use unit::Request;
