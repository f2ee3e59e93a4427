use super::{EPISODE_INDEX, EpisodeDataIndex, EpisodeDataset, INDEX, Item};
use crate::{
    ensure_valid,
    episodes::CompiledEpisodes,
    error::{Result, RollmixError},
    weights::calculate_online_sample_weight,
};
use rand::{SeedableRng, distr::Distribution, distr::weighted::WeightedIndex, rngs::StdRng};

/// Episodes collected while training, grown one merge at a time.
#[derive(Debug, Clone, Default)]
pub struct OnlineDataset {
    episodes: EpisodeDataset,
    episode_data_index: EpisodeDataIndex,
}

impl OnlineDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn episodes(&self) -> &EpisodeDataset {
        &self.episodes
    }

    pub fn episode_data_index(&self) -> &EpisodeDataIndex {
        &self.episode_data_index
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Offline,
    Online,
}

/// Length bookkeeping of the offline dataset followed by the online one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatDataset {
    pub offline_len: usize,
    pub online_len: usize,
    pub cumulative_sizes: Vec<usize>,
}

impl ConcatDataset {
    pub fn new(offline_len: usize, online_len: usize) -> Self {
        Self {
            offline_len,
            online_len,
            cumulative_sizes: vec![offline_len, offline_len + online_len],
        }
    }

    pub fn len(&self) -> usize {
        self.offline_len + self.online_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps a combined index to its dataset and the index within it.
    pub fn locate(&self, idx: usize) -> Option<(Source, usize)> {
        if idx < self.offline_len {
            Some((Source::Offline, idx))
        } else if idx < self.len() {
            Some((Source::Online, idx - self.offline_len))
        } else {
            None
        }
    }
}

/// Draws `num_samples` combined indices with replacement, proportionally to `weights`.
#[derive(Debug, Clone)]
pub struct WeightedSampler {
    pub weights: Vec<f64>,
    pub num_samples: usize,
    rng: StdRng,
}

impl WeightedSampler {
    pub fn new(weights: Vec<f64>, num_samples: usize, seed: u64) -> Self {
        Self {
            weights,
            num_samples,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn sample_indices(&mut self) -> Result<Vec<usize>> {
        let distribution = WeightedIndex::new(&self.weights).map_err(|err| {
            RollmixError::Validation(format!("cannot sample from the current weights: {err}"))
        })?;
        Ok((0..self.num_samples)
            .map(|_| distribution.sample(&mut self.rng))
            .collect())
    }
}

/// Folds a zero based batch of episodes into `online`, shifting its indices to continue after
/// the existing episodes, then refreshes `concat` and the weights of `sampler` so that online
/// samples are drawn with probability `pc_online_samples`.
///
/// Nothing is modified when the call fails. Merging an empty batch is a no-op.
pub fn add_episodes_inplace(
    online: &mut OnlineDataset,
    concat: &mut ConcatDataset,
    sampler: &mut WeightedSampler,
    episodes: &EpisodeDataset,
    episode_data_index: &EpisodeDataIndex,
    pc_online_samples: f64,
) -> Result<()> {
    let (Some((first_episode, _)), Some((first_index, last_index))) = (
        episodes.first_and_last(EPISODE_INDEX)?,
        episodes.first_and_last(INDEX)?,
    ) else {
        ensure_valid!(
            episode_data_index.is_empty(),
            "got {} episode ranges for an empty batch",
            episode_data_index.len()
        );
        return Ok(());
    };
    ensure_valid!(
        first_episode == 0,
        "incoming episodes must start at episode index 0, got {first_episode}"
    );
    ensure_valid!(
        first_index == 0,
        "incoming episodes must start at global index 0, got {first_index}"
    );
    ensure_valid!(
        episodes.indices()?.into_iter().eq(0..episodes.len() as i64),
        "incoming global indices must run 0..{} in order, got 0..={last_index}",
        episodes.len()
    );
    let expected = EpisodeDataIndex::from_episode_column(&episodes.episode_indices()?)?;
    ensure_valid!(
        *episode_data_index == expected,
        "episode ranges {:?}..{:?} do not match the episodes of the batch, expected {:?}..{:?}",
        episode_data_index.from,
        episode_data_index.to,
        expected.from,
        expected.to
    );

    let merged = if online.is_empty() {
        OnlineDataset {
            episodes: episodes.clone(),
            episode_data_index: episode_data_index.clone(),
        }
    } else {
        let (_, last_episode) = online
            .episodes
            .first_and_last(EPISODE_INDEX)?
            .ok_or_else(|| RollmixError::Validation("online dataset has no episodes".into()))?;
        let (_, last_online_index) = online
            .episodes
            .first_and_last(INDEX)?
            .ok_or_else(|| RollmixError::Validation("online dataset has no frames".into()))?;
        let shifted = episodes.shift_indices(last_episode + 1, last_online_index + 1)?;
        OnlineDataset {
            episodes: online.episodes.concat(&shifted)?,
            episode_data_index: online
                .episode_data_index
                .concat(&episode_data_index.shifted(last_online_index as usize + 1))?,
        }
    };
    merged.episode_data_index.validate_contiguous(merged.len())?;

    let merged_concat = ConcatDataset::new(concat.offline_len, merged.len());
    let online_weight =
        calculate_online_sample_weight(merged_concat.offline_len, merged_concat.online_len, pc_online_samples)?;
    let mut weights = vec![1.0; merged_concat.offline_len];
    weights.extend(std::iter::repeat_n(online_weight, merged_concat.online_len));

    tracing::info!(
        new_frames = episodes.len(),
        online_frames = merged.len(),
        offline_frames = merged_concat.offline_len,
        online_weight,
        "merged online episodes"
    );
    *online = merged;
    *concat = merged_concat;
    sampler.num_samples = weights.len();
    sampler.weights = weights;
    Ok(())
}

/// A fixed offline dataset sampled together with a growing online one.
#[derive(Debug, Clone)]
pub struct MixedDataset {
    offline: EpisodeDataset,
    online: OnlineDataset,
    concat: ConcatDataset,
    sampler: WeightedSampler,
    pc_online_samples: f64,
}

impl MixedDataset {
    pub fn new(offline: EpisodeDataset, pc_online_samples: f64, seed: u64) -> Self {
        let offline_len = offline.len();
        Self {
            offline,
            online: OnlineDataset::new(),
            concat: ConcatDataset::new(offline_len, 0),
            sampler: WeightedSampler::new(vec![1.0; offline_len], offline_len, seed),
            pc_online_samples,
        }
    }

    pub fn add_episodes(&mut self, episodes: &CompiledEpisodes) -> Result<()> {
        add_episodes_inplace(
            &mut self.online,
            &mut self.concat,
            &mut self.sampler,
            &episodes.dataset,
            &episodes.episode_data_index,
            self.pc_online_samples,
        )
    }

    /// Returns a new snapshot with `episodes` merged, leaving `self` untouched.
    pub fn with_episodes(&self, episodes: &CompiledEpisodes) -> Result<Self> {
        let mut merged = self.clone();
        merged.add_episodes(episodes)?;
        Ok(merged)
    }

    pub fn len(&self) -> usize {
        self.concat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concat.is_empty()
    }

    pub fn get(&self, idx: usize) -> Result<Item> {
        match self.concat.locate(idx) {
            Some((Source::Offline, idx)) => self.offline.get(idx),
            Some((Source::Online, idx)) => self.online.episodes.get(idx),
            None => Err(RollmixError::Validation(format!(
                "index {idx} is out of bounds for {} frames",
                self.len()
            ))),
        }
    }

    pub fn sample_indices(&mut self) -> Result<Vec<usize>> {
        self.sampler.sample_indices()
    }

    pub fn offline(&self) -> &EpisodeDataset {
        &self.offline
    }

    pub fn online(&self) -> &OnlineDataset {
        &self.online
    }

    pub fn concat(&self) -> &ConcatDataset {
        &self.concat
    }

    pub fn sampler(&self) -> &WeightedSampler {
        &self.sampler
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::synthetic_episodes;

    #[test]
    fn concat_locates_both_sources() {
        let concat = ConcatDataset::new(3, 2);
        assert_eq!(concat.cumulative_sizes, vec![3, 5]);
        assert_eq!(concat.locate(2), Some((Source::Offline, 2)));
        assert_eq!(concat.locate(3), Some((Source::Online, 0)));
        assert_eq!(concat.locate(5), None);
    }

    #[test]
    fn sampling_follows_the_weights() -> Result<()> {
        let mut sampler = WeightedSampler::new(vec![1.0, 1.0, 0.0, 2.0], 4000, 0);
        let samples = sampler.sample_indices()?;
        assert_eq!(samples.len(), 4000);
        assert!(!samples.contains(&2));
        let last = samples.iter().filter(|idx| **idx == 3).count() as f64 / 4000.;
        assert!((last - 0.5).abs() < 0.05, "{last}");
        Ok(())
    }

    #[test]
    fn mixed_dataset_reaches_the_target_fraction() -> Result<()> {
        let offline = synthetic_episodes(&[50, 50])?.dataset;
        let mut mixed = MixedDataset::new(offline, 0.5, 7);
        mixed.add_episodes(&synthetic_episodes(&[20, 30])?)?;
        assert_eq!(mixed.len(), 150);
        assert_eq!(mixed.sampler().num_samples, 150);
        assert!((mixed.sampler().weights[149] - 2.0).abs() < 1e-12);
        let online = mixed
            .sample_indices()?
            .into_iter()
            .filter(|idx| *idx >= 100)
            .count() as f64
            / 150.;
        assert!((online - 0.5).abs() < 0.15, "{online}");
        assert_eq!(mixed.get(100)?[INDEX].to_scalar::<i64>()?, 0);
        assert!(mixed.get(150).is_err());
        Ok(())
    }

    #[test]
    fn snapshots_leave_the_original_alone() -> Result<()> {
        let mixed = MixedDataset::new(synthetic_episodes(&[4])?.dataset, 0.5, 0);
        let merged = mixed.with_episodes(&synthetic_episodes(&[2])?)?;
        assert_eq!(mixed.len(), 4);
        assert_eq!(merged.len(), 6);
        Ok(())
    }
}
