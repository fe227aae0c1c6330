//! API routes and handlers.

pub mod answer;
pub mod audio;
pub mod internal;
pub mod request_context;
mod router;

pub use router::create_router;
