pub mod eval;

pub use eval::{EvalConfig, OnlineConfig};
