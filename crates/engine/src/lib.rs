pub mod bundle;
pub mod engine;
pub mod feed;

pub use engine::NegotiationEngine;
pub use feed::TaskFeed;
