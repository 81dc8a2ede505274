//! Source engine (spec §4.2): scheduler, session state, and the
//! collaborator traits it is generic over.

pub mod collab;
pub mod engine;
pub mod state;

pub use collab::{DirtyScanner, RateLimiter, ScanStep, Unlimited};
pub use engine::{SourceBlock, SourceEngine};
pub use state::PostcopyOutgoingState;
