pub mod cache;
pub mod error;
pub mod hash;
pub mod scanner;
pub mod snapshot;
pub mod store;
pub mod zones;

pub use cache::{InitOutcome, LocationCache};
pub use error::{LookupError, RefreshError};
