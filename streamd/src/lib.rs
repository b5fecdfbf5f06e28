pub mod auth;
pub mod blob;
pub mod config;
pub mod content_type;
pub mod edge;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod hot_storage;
pub mod metrics;
pub mod offset;
pub mod producer;
pub mod registry;
pub mod segment_codec;
pub mod sequencer;
pub mod state;

pub use state::AppState;

use axum::Router;

pub fn build_router(state: AppState) -> Router {
    edge::router::build_router(state)
}
