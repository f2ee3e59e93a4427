pub mod boundary;
pub mod dataset;
pub mod env;
pub mod episodes;
pub mod error;
pub mod observation;
pub mod policy;
pub mod progress;
pub mod rollout;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod weights;

pub use error::{Result, RollmixError};
