pub mod filter;
pub mod memory;
pub mod queries;
pub mod store;

pub use filter::{Filter, Order};
pub use memory::MemoryStore;
pub use queries::TaskQueries;
pub use store::{procedure, relation, RelationalStore, StoreError};
