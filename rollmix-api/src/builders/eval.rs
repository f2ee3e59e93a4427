use crate::{
    error::Result,
    evaluator::Evaluator,
    video::{GifWriter, VideoWriter},
};
use rollmix_core::dataset::{EpisodeDataset, MixedDataset};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub n_episodes: usize,
    /// Number of episodes to write videos for, the first ones being picked.
    pub max_episodes_rendered: usize,
    /// Required as soon as `max_episodes_rendered > 0`.
    pub video_dir: Option<PathBuf>,
    pub return_episode_data: bool,
    /// Batch `b` is seeded with `start_seed + b * num_envs ..`, environments are left unseeded
    /// without it.
    pub start_seed: Option<u64>,
    pub enable_progbar: bool,
    pub enable_inner_progbar: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            n_episodes: 10,
            max_episodes_rendered: 0,
            video_dir: None,
            return_episode_data: false,
            start_seed: None,
            enable_progbar: false,
            enable_inner_progbar: false,
        }
    }
}

impl EvalConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn build(&self) -> Evaluator {
        self.build_with_writer(Arc::new(GifWriter))
    }

    pub fn build_with_writer(&self, video_writer: Arc<dyn VideoWriter>) -> Evaluator {
        Evaluator {
            config: self.clone(),
            video_writer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    /// Episodes collected per round.
    pub rollout_n_episodes: usize,
    /// Fraction of the samples to draw from online data.
    pub pc_online_samples: f64,
    pub start_seed: Option<u64>,
    /// Seed of the weighted sampler.
    pub sampler_seed: u64,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            rollout_n_episodes: 1,
            pc_online_samples: 0.5,
            start_seed: None,
            sampler_seed: 0,
        }
    }
}

impl OnlineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// An empty online dataset next to `offline`, sampled with the configured online fraction.
    pub fn mixed_dataset(&self, offline: EpisodeDataset) -> MixedDataset {
        MixedDataset::new(offline, self.pc_online_samples, self.sampler_seed)
    }

    /// Evaluation settings used to collect one round of episodes.
    pub fn eval_config(&self) -> EvalConfig {
        EvalConfig {
            n_episodes: self.rollout_n_episodes,
            return_episode_data: true,
            start_seed: self.start_seed,
            ..EvalConfig::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() -> Result<()> {
        let config = EvalConfig::from_json(r#"{"n_episodes": 4, "start_seed": 1000}"#)?;
        assert_eq!(config.n_episodes, 4);
        assert_eq!(config.start_seed, Some(1000));
        assert_eq!(config.max_episodes_rendered, 0);
        let online = OnlineConfig::from_json(r#"{"pc_online_samples": 0.25}"#)?;
        assert_eq!(online.rollout_n_episodes, 1);
        assert!(online.eval_config().return_episode_data);
        assert!(EvalConfig::from_json(r#"{"n_episodes": "four"}"#).is_err());
        Ok(())
    }
}
