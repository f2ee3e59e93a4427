mod controller;
mod point_reach;

use anyhow::{Context, Result};
use clap::Parser;
use controller::ProportionalController;
use point_reach::PointReach;
use rollmix_api::{EvalConfig, OnlineConfig, collect_online_episodes, eval_policy};
use rollmix_core::{
    dataset::storage::save_episodes,
    env::{SyncVecEnv, ThreadVecEnv, VecEnv},
    policy::PolicyWithUpdate,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Collects online episodes next to an offline dataset, then evaluates the policy")]
struct Args {
    /// Environments stepped together
    #[arg(long, default_value_t = 4)]
    n_envs: usize,

    /// Run every environment on its own thread
    #[arg(long)]
    threaded: bool,

    #[arg(long, default_value_t = 8)]
    offline_episodes: usize,

    #[arg(long, default_value_t = 3)]
    online_rounds: usize,

    /// JSON file with the online collection settings
    #[arg(long)]
    online_config: Option<PathBuf>,

    /// JSON file with the final evaluation settings
    #[arg(long)]
    eval_config: Option<PathBuf>,

    /// Exploration noise of the policy that collects data
    #[arg(long, default_value_t = 0.3)]
    noise: f32,

    /// Factor applied to the exploration noise after every online round
    #[arg(long, default_value_t = 0.7)]
    noise_decay: f32,

    #[arg(long, default_value_t = 5.0)]
    gain: f64,

    #[arg(long, default_value_t = 100)]
    max_steps: usize,

    #[arg(long, default_value_t = 32)]
    image_size: usize,

    #[arg(long, default_value = "rollmix-out")]
    out_dir: PathBuf,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn read_json(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let (max_steps, image_size) = (args.max_steps, args.image_size);
    let builder = move || PointReach::new(max_steps, image_size);
    let mut env: Box<dyn VecEnv> = if args.threaded {
        Box::new(ThreadVecEnv::new(builder, args.n_envs)?)
    } else {
        Box::new(SyncVecEnv::from_builder(&builder, args.n_envs)?)
    };
    let mut explorer =
        ProportionalController::new(args.gain, args.noise, args.seed).with_noise_decay(args.noise_decay);

    let offline_config = EvalConfig {
        n_episodes: args.offline_episodes,
        return_episode_data: true,
        start_seed: Some(args.seed),
        enable_progbar: true,
        ..EvalConfig::default()
    };
    let offline = eval_policy(env.as_mut(), &mut explorer, &offline_config)?
        .episodes
        .context("offline collection returned no episodes")?;
    tracing::info!(
        episodes = offline.num_episodes(),
        frames = offline.num_frames(),
        "collected the offline dataset"
    );

    let online_config = match &args.online_config {
        Some(path) => OnlineConfig::from_json(&read_json(path)?)?,
        None => OnlineConfig {
            rollout_n_episodes: args.n_envs,
            start_seed: Some(args.seed + 10_000),
            sampler_seed: args.seed,
            ..OnlineConfig::default()
        },
    };
    let mut mixed = online_config.mixed_dataset(offline.dataset);
    for round in 0..args.online_rounds {
        let round_config = OnlineConfig {
            start_seed: online_config
                .start_seed
                .map(|seed| seed + (round * online_config.rollout_n_episodes) as u64),
            ..online_config.clone()
        };
        let info =
            collect_online_episodes(env.as_mut(), &mut explorer, &mut mixed, &round_config)?;
        explorer.update();
        let drawn = mixed.sample_indices()?;
        let online_share = drawn
            .iter()
            .filter(|idx| **idx >= mixed.offline().len())
            .count() as f64
            / drawn.len().max(1) as f64;
        tracing::info!(
            round,
            pc_success = info.aggregated.pc_success,
            online_frames = mixed.online().len(),
            online_share,
            noise = explorer.noise,
            "online round done"
        );
    }

    let eval_config = match &args.eval_config {
        Some(path) => EvalConfig::from_json(&read_json(path)?)?,
        None => EvalConfig {
            n_episodes: 2 * args.n_envs,
            max_episodes_rendered: 2,
            video_dir: Some(args.out_dir.join("videos")),
            start_seed: Some(args.seed + 100_000),
            enable_progbar: true,
            ..EvalConfig::default()
        },
    };
    let mut policy = ProportionalController::new(args.gain, 0., args.seed);
    let info = eval_policy(env.as_mut(), &mut policy, &eval_config)?;
    println!("{}", serde_json::to_string_pretty(&info.aggregated)?);
    for path in &info.video_paths {
        tracing::info!(path = %path.display(), "wrote video");
    }

    std::fs::create_dir_all(&args.out_dir)?;
    let path = args.out_dir.join("online.safetensors");
    let online = mixed.online();
    save_episodes(online.episodes(), online.episode_data_index(), &path)?;
    tracing::info!(path = %path.display(), frames = online.len(), "saved the online dataset");
    Ok(())
}
