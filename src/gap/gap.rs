//! Generic Access Profile types ([Vol 3] Part C).

pub use uuid::*;

mod uuid;
