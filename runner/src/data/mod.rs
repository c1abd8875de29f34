pub mod loader;
pub mod shard;

pub use loader::{DataLoader, InMemoryDataLoader};
pub use shard::{Column, Shard};
