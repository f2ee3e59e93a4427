use crate::{
    builders::OnlineConfig,
    error::{EvalError, Result},
    evaluator::{EvalInfo, Evaluator},
};
use rollmix_core::{dataset::MixedDataset, env::VecEnv, policy::Policy};

/// Collects `rollout_n_episodes` fresh episodes with `policy` and folds them into the online
/// part of `mixed`. Returns the evaluation that produced them.
///
/// `mixed` keeps the online fraction it was created with, see [`OnlineConfig::mixed_dataset`].
pub fn collect_online_episodes<V: VecEnv + ?Sized, P: Policy + ?Sized>(
    env: &mut V,
    policy: &mut P,
    mixed: &mut MixedDataset,
    config: &OnlineConfig,
) -> Result<EvalInfo> {
    let info = Evaluator::new(config.eval_config()).eval_policy(env, policy)?;
    let episodes = info
        .episodes
        .as_ref()
        .ok_or_else(|| EvalError::validation("evaluation returned no episode data"))?;
    mixed.add_episodes(episodes)?;
    tracing::info!(
        collected_frames = episodes.num_frames(),
        online_frames = mixed.online().len(),
        "collected online episodes"
    );
    Ok(info)
}
