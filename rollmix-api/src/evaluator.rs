use crate::{
    builders::EvalConfig,
    error::{EvalError, Result, VideoTaskFailure},
    video::{GifWriter, VideoWriter},
};
use candle_core::Tensor;
use rollmix_core::{
    boundary::BoundaryInfo,
    env::VecEnv,
    episodes::{CompiledEpisodes, compile_episode_data},
    policy::Policy,
    progress::progress_bar,
    rollout::rollout,
};
use serde::Serialize;
use std::{
    path::PathBuf,
    sync::Arc,
    thread::JoinHandle,
    time::Instant,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeMetrics {
    pub episode_ix: usize,
    pub sum_reward: f32,
    pub max_reward: f32,
    pub success: bool,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedMetrics {
    pub avg_sum_reward: f64,
    pub avg_max_reward: f64,
    pub pc_success: f64,
    pub eval_s: f64,
    pub eval_ep_s: f64,
}

#[derive(Debug, Clone)]
pub struct EvalInfo {
    pub per_episode: Vec<EpisodeMetrics>,
    pub aggregated: AggregatedMetrics,
    /// Compiled episodes, when requested with `return_episode_data`.
    pub episodes: Option<CompiledEpisodes>,
    pub video_paths: Vec<PathBuf>,
}

struct VideoTask {
    path: PathBuf,
    handle: JoinHandle<anyhow::Result<()>>,
}

#[derive(Default)]
struct Collected {
    sum_rewards: Vec<f32>,
    max_rewards: Vec<f32>,
    successes: Vec<bool>,
    seeds: Vec<Option<u64>>,
    episodes: Option<CompiledEpisodes>,
    video_paths: Vec<PathBuf>,
    n_episodes_rendered: usize,
}

/// Runs a policy over batches of environments and reports per episode and aggregated metrics.
pub struct Evaluator {
    pub config: EvalConfig,
    pub video_writer: Arc<dyn VideoWriter>,
}

impl Evaluator {
    pub fn new(config: EvalConfig) -> Self {
        Self {
            config,
            video_writer: Arc::new(GifWriter),
        }
    }

    /// Evaluates `policy` over `n_episodes` episodes, `env.num_envs()` at a time.
    ///
    /// The last batch may run more episodes than needed, the extra ones are dropped from the
    /// metrics and never compiled. Video tasks run on their own threads and are all joined
    /// before returning, failures are reported together as [`EvalError::VideoTasks`].
    pub fn eval_policy<V: VecEnv + ?Sized, P: Policy + ?Sized>(
        &self,
        env: &mut V,
        policy: &mut P,
    ) -> Result<EvalInfo> {
        let config = &self.config;
        if config.n_episodes == 0 {
            return Err(EvalError::validation("n_episodes must be at least 1"));
        }
        if config.max_episodes_rendered > 0 && config.video_dir.is_none() {
            return Err(EvalError::validation(
                "a video_dir is required to render episodes",
            ));
        }
        let start = Instant::now();
        let mut tasks = vec![];
        let collected = self.run_batches(env, policy, &mut tasks);
        let failures = join_video_tasks(tasks);
        let collected = match collected {
            Ok(collected) => collected,
            Err(err) => {
                for failure in &failures {
                    tracing::error!(%failure, "video task failed");
                }
                return Err(err);
            }
        };
        if !failures.is_empty() {
            return Err(EvalError::VideoTasks(failures));
        }

        let n_episodes = config.n_episodes;
        let eval_s = start.elapsed().as_secs_f64();
        let per_episode = (0..n_episodes)
            .map(|episode_ix| EpisodeMetrics {
                episode_ix,
                sum_reward: collected.sum_rewards[episode_ix],
                max_reward: collected.max_rewards[episode_ix],
                success: collected.successes[episode_ix],
                seed: collected.seeds[episode_ix],
            })
            .collect::<Vec<_>>();
        let aggregated = AggregatedMetrics {
            avg_sum_reward: nanmean(per_episode.iter().map(|ep| ep.sum_reward as f64)),
            avg_max_reward: nanmean(per_episode.iter().map(|ep| ep.max_reward as f64)),
            pc_success: nanmean(per_episode.iter().map(|ep| f64::from(u8::from(ep.success))))
                * 100.,
            eval_s,
            eval_ep_s: eval_s / n_episodes as f64,
        };
        tracing::info!(
            n_episodes,
            avg_sum_reward = aggregated.avg_sum_reward,
            avg_max_reward = aggregated.avg_max_reward,
            pc_success = aggregated.pc_success,
            eval_s,
            "evaluation finished"
        );
        Ok(EvalInfo {
            per_episode,
            aggregated,
            episodes: collected.episodes,
            video_paths: collected.video_paths,
        })
    }

    fn run_batches<V: VecEnv + ?Sized, P: Policy + ?Sized>(
        &self,
        env: &mut V,
        policy: &mut P,
        tasks: &mut Vec<VideoTask>,
    ) -> Result<Collected> {
        let config = &self.config;
        let num_envs = env.num_envs();
        let fps = env.render_fps();
        let n_batches = config.n_episodes.div_ceil(num_envs);
        let mut collected = Collected::default();
        let progbar = progress_bar(n_batches as u64, "eval", config.enable_progbar);

        for batch_ix in 0..n_batches {
            let seeds = config.start_seed.map(|start_seed| {
                let first = start_seed + (batch_ix * num_envs) as u64;
                (first..first + num_envs as u64).collect::<Vec<_>>()
            });

            let mut frames: Vec<Tensor> = vec![];
            let n_to_render_now = config
                .max_episodes_rendered
                .saturating_sub(collected.n_episodes_rendered)
                .min(num_envs);
            let mut render_frame = |env: &mut V| -> anyhow::Result<()> {
                frames.push(env.render()?.narrow(0, 0, n_to_render_now)?);
                Ok(())
            };
            let render_callback = if n_to_render_now > 0 {
                Some(&mut render_frame as &mut dyn FnMut(&mut V) -> anyhow::Result<()>)
            } else {
                None
            };
            let batch = rollout(
                env,
                policy,
                seeds.as_deref(),
                config.return_episode_data,
                render_callback,
                config.enable_inner_progbar,
            )?;
            let boundary = BoundaryInfo::resolve(&batch.done)?;

            let n_before = collected.sum_rewards.len();
            collected.sum_rewards.extend(boundary.masked_sum(&batch.reward)?);
            collected.max_rewards.extend(boundary.masked_max(&batch.reward)?);
            collected.successes.extend(boundary.masked_any(&batch.success)?);
            match &seeds {
                Some(seeds) => collected.seeds.extend(seeds.iter().copied().map(Some)),
                None => collected.seeds.extend(std::iter::repeat_n(None, num_envs)),
            }
            tracing::debug!(batch_ix, n_steps = boundary.n_steps(), "evaluated batch");

            if config.return_episode_data {
                let n_keep = (config.n_episodes - n_before).min(num_envs);
                let (start_episode_index, start_data_index) = match &collected.episodes {
                    Some(episodes) => (episodes.num_episodes(), episodes.num_frames()),
                    None => (0, 0),
                };
                let this_batch = compile_episode_data(
                    &batch.take_episodes(n_keep)?,
                    &boundary.take(n_keep)?,
                    start_episode_index,
                    start_data_index,
                    fps,
                )?;
                let episodes = match collected.episodes.take() {
                    Some(episodes) => episodes.concat(&this_batch)?,
                    None => this_batch,
                };
                episodes
                    .episode_data_index
                    .validate_contiguous(episodes.num_frames())?;
                collected.episodes = Some(episodes);
            }

            if !frames.is_empty() {
                let stacked = Tensor::stack(&frames, 1).map_err(rollmix_core::RollmixError::from)?;
                self.dispatch_videos(&stacked, &boundary, fps, &mut collected, tasks)?;
            }

            let done = collected.successes.len().min(config.n_episodes);
            let running_success_rate =
                collected.successes[..done].iter().filter(|s| **s).count() as f64 / done as f64;
            progbar.set_message(format!(
                "running_success_rate={:.1}%",
                running_success_rate * 100.
            ));
            progbar.inc(1);
        }
        progbar.finish_and_clear();
        Ok(collected)
    }

    /// Starts one encoding thread per captured episode of the batch.
    fn dispatch_videos(
        &self,
        stacked: &Tensor,
        boundary: &BoundaryInfo,
        fps: f64,
        collected: &mut Collected,
        tasks: &mut Vec<VideoTask>,
    ) -> Result<()> {
        let Some(video_dir) = &self.config.video_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(video_dir)?;
        let n_captured = stacked.dims()[0];
        for episode in 0..n_captured {
            if collected.n_episodes_rendered >= self.config.max_episodes_rendered {
                break;
            }
            // the reset frame comes first, so the episode spans `episode_len` frames
            let frames = stacked
                .get(episode)
                .and_then(|frames| frames.narrow(0, 0, boundary.episode_len(episode)))
                .map_err(rollmix_core::RollmixError::from)?;
            let path = video_dir.join(format!(
                "eval_episode_{}.{}",
                collected.n_episodes_rendered,
                self.video_writer.extension()
            ));
            tracing::debug!(path = %path.display(), "dispatching video task");
            let writer = self.video_writer.clone();
            let task_path = path.clone();
            let handle = std::thread::Builder::new()
                .name(format!("video-{}", collected.n_episodes_rendered))
                .spawn(move || writer.write(&task_path, &frames, fps))?;
            tasks.push(VideoTask {
                path: path.clone(),
                handle,
            });
            collected.video_paths.push(path);
            collected.n_episodes_rendered += 1;
        }
        Ok(())
    }
}

/// Convenience wrapper writing videos as GIFs.
pub fn eval_policy<V: VecEnv + ?Sized, P: Policy + ?Sized>(
    env: &mut V,
    policy: &mut P,
    config: &EvalConfig,
) -> Result<EvalInfo> {
    Evaluator::new(config.clone()).eval_policy(env, policy)
}

fn join_video_tasks(tasks: Vec<VideoTask>) -> Vec<VideoTaskFailure> {
    tasks
        .into_iter()
        .filter_map(|task| {
            let message = match task.handle.join() {
                Ok(Ok(())) => return None,
                Ok(Err(err)) => format!("{err:#}"),
                Err(_) => "video task panicked".to_owned(),
            };
            Some(VideoTaskFailure {
                path: task.path,
                message,
            })
        })
        .collect()
}

fn nanmean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .filter(|value| !value.is_nan())
        .fold((0., 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 { f64::NAN } else { sum / count as f64 }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nanmean_skips_nans() {
        assert_eq!(nanmean([1., f64::NAN, 3.].into_iter()), 2.);
        assert!(nanmean([f64::NAN].into_iter()).is_nan());
    }
}
