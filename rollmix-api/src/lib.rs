// evaluation, video output and online collection on top of rollmix-core
pub mod builders;
pub mod error;
pub mod evaluator;
pub mod online;
pub mod video;

pub use builders::{EvalConfig, OnlineConfig};
pub use error::{EvalError, Result};
pub use evaluator::{EvalInfo, Evaluator, eval_policy};
pub use online::collect_online_episodes;
