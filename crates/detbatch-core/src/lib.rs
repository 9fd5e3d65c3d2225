pub mod error;
pub mod traits;
pub mod types;

pub use error::{DetError, Result};
pub use traits::{Detector, Transform};
pub use types::*;
