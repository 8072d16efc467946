//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod evictor;
mod gate;
mod registry;

pub use backend::AdmissionBackend;
pub use bucket::{Decision, Limit, Reservation, TokenBucket, WaitContext};
pub use evictor::Evictor;
pub use gate::{AdmissionGate, DEFAULT_CLEANUP_INTERVAL};
pub use registry::KeyedRegistry;
