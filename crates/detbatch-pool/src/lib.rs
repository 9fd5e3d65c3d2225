pub mod slab;
pub mod worker;

pub use slab::{SlabLease, SlabPool};
pub use worker::WorkerPool;
