//! Edge tier (spec §4.7-§4.10): the parallel, stateless-per-request HTTP
//! surface in front of the single-writer sequencer tier.

pub mod cache;
pub mod coalescer;
pub mod router;
pub mod sse_bridge;
