use crate::{
    boundary::BoundaryInfo,
    dataset::{
        ACTION, EPISODE_INDEX, EpisodeDataIndex, EpisodeDataset, FRAME_INDEX, INDEX, NEXT_DONE,
        NEXT_REWARD, TIMESTAMP,
    },
    ensure_valid,
    error::{Result, RollmixError},
    observation::is_image_key,
    rollout::RolloutBatch,
};
use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;

/// Episodes in dataset form together with their global frame ranges.
#[derive(Debug, Clone, Default)]
pub struct CompiledEpisodes {
    pub dataset: EpisodeDataset,
    pub episode_data_index: EpisodeDataIndex,
}

impl CompiledEpisodes {
    pub fn num_frames(&self) -> usize {
        self.dataset.len()
    }

    pub fn num_episodes(&self) -> usize {
        self.episode_data_index.len()
    }

    /// Appends `next`, which has to continue the episode and global indices of `self`.
    pub fn concat(&self, next: &Self) -> Result<Self> {
        if let (Some((_, last_episode)), Some((next_episode, _))) = (
            self.dataset.first_and_last(EPISODE_INDEX)?,
            next.dataset.first_and_last(EPISODE_INDEX)?,
        ) {
            ensure_valid!(
                last_episode + 1 == next_episode,
                "episode {next_episode} does not follow episode {last_episode}"
            );
        }
        if let (Some((_, last_index)), Some((next_index, _))) = (
            self.dataset.first_and_last(INDEX)?,
            next.dataset.first_and_last(INDEX)?,
        ) {
            ensure_valid!(
                last_index + 1 == next_index,
                "frame {next_index} does not follow frame {last_index}"
            );
        }
        Ok(Self {
            dataset: self.dataset.concat(&next.dataset)?,
            episode_data_index: self.episode_data_index.concat(&next.episode_data_index)?,
        })
    }
}

/// Turns a rollout into dataset frames, one episode per batch row, cut at the row's done step.
///
/// Episodes are numbered from `start_episode_index` and frames from `start_data_index`, so that
/// consecutive rollouts compile into one contiguous dataset. Image observations are expected
/// channel first in `[0, 1]` and are stored as u8 channel last.
pub fn compile_episode_data(
    rollout: &RolloutBatch,
    boundary: &BoundaryInfo,
    start_episode_index: usize,
    start_data_index: usize,
    fps: f64,
) -> Result<CompiledEpisodes> {
    let (batch_size, n_steps) = rollout.dims()?;
    ensure_valid!(
        boundary.batch_size() == batch_size && boundary.n_steps() == n_steps,
        "boundaries cover {}x{} steps, the rollout {batch_size}x{n_steps}",
        boundary.batch_size(),
        boundary.n_steps()
    );
    ensure_valid!(fps > 0., "fps must be positive, got {fps}");

    let mut per_key: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();
    let mut episode_data_index = EpisodeDataIndex::default();
    let mut data_index_from = start_data_index;

    for episode in 0..boundary.batch_size() {
        let num_frames = boundary.episode_len(episode);
        let frame_index = (0..num_frames as i64).collect::<Vec<_>>();
        let timestamp = frame_index
            .iter()
            .map(|frame| (*frame as f64 / fps) as f32)
            .collect::<Vec<_>>();
        let mut push = |key: &str, value: Tensor| {
            per_key.entry(key.to_owned()).or_default().push(value);
        };
        push(ACTION, rollout.action.get(episode)?.narrow(0, 0, num_frames)?);
        push(
            EPISODE_INDEX,
            Tensor::full((start_episode_index + episode) as i64, num_frames, &Device::Cpu)?,
        );
        push(FRAME_INDEX, Tensor::from_vec(frame_index, num_frames, &Device::Cpu)?);
        push(TIMESTAMP, Tensor::from_vec(timestamp, num_frames, &Device::Cpu)?);
        push(NEXT_DONE, rollout.done.get(episode)?.narrow(0, 0, num_frames)?);
        push(
            NEXT_REWARD,
            rollout
                .reward
                .get(episode)?
                .narrow(0, 0, num_frames)?
                .to_dtype(DType::F32)?,
        );
        if let Some(observation) = &rollout.observation {
            for (key, value) in observation.iter() {
                let frames = value.get(episode)?.narrow(0, 0, num_frames)?;
                let frames = if is_image_key(key) {
                    image_frames_to_storage(key, &frames)?
                } else {
                    frames
                };
                push(key.as_str(), frames);
            }
        }

        episode_data_index.push(data_index_from, data_index_from + num_frames);
        data_index_from += num_frames;
    }

    let total_frames = data_index_from - start_data_index;
    let mut columns = per_key
        .into_iter()
        .map(|(key, parts)| Ok((key, Tensor::cat(&parts, 0)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    let index = (start_data_index as i64..data_index_from as i64).collect::<Vec<_>>();
    columns.insert(
        INDEX.to_owned(),
        Tensor::from_vec(index, total_frames, &Device::Cpu)?,
    );
    Ok(CompiledEpisodes {
        dataset: EpisodeDataset::from_columns(columns)?,
        episode_data_index,
    })
}

/// Checks `(t, c, h, w)` f32 frames in `[0, 1]` and converts them to `(t, h, w, c)` u8.
fn image_frames_to_storage(key: &str, frames: &Tensor) -> Result<Tensor> {
    ensure_valid!(
        frames.rank() == 4,
        "expected `{key}` frames of shape (t, c, h, w), got {:?}",
        frames.dims()
    );
    let (_, c, h, w) = frames.dims4()?;
    ensure_valid!(
        c < h && c < w,
        "expected channel first images for `{key}`, got (c, h, w) = ({c}, {h}, {w})"
    );
    ensure_valid!(
        frames.dtype() == DType::F32,
        "expected f32 images for `{key}`, got {:?}",
        frames.dtype()
    );
    let max = frames.max_all()?.to_scalar::<f32>()?;
    let min = frames.min_all()?.to_scalar::<f32>()?;
    if max > 1. || min < 0. {
        return Err(RollmixError::Validation(format!(
            "expected `{key}` pixels in [0, 1], got values in [{min}, {max}]"
        )));
    }
    Ok(frames
        .affine(255., 0.)?
        .to_dtype(DType::U8)?
        .permute((0, 2, 3, 1))?
        .contiguous()?)
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::Device;

    fn rollout_batch(done: Vec<u8>, image: Tensor) -> Result<RolloutBatch> {
        let (b, s) = (2, 5);
        let observation = crate::observation::Observation::new()
            .with("observation.image", image)
            .with(
                "observation.state",
                Tensor::zeros((b, s + 1, 3), DType::F32, &Device::Cpu)?,
            );
        Ok(RolloutBatch {
            action: Tensor::zeros((b, s, 2), DType::F32, &Device::Cpu)?,
            reward: Tensor::ones((b, s), DType::F32, &Device::Cpu)?,
            success: Tensor::zeros((b, s), DType::U8, &Device::Cpu)?,
            done: Tensor::from_vec(done, (b, s), &Device::Cpu)?,
            observation: Some(observation),
        })
    }

    fn done_at_2_and_4() -> Vec<u8> {
        vec![0, 0, 1, 1, 1, 0, 0, 0, 0, 1]
    }

    #[test]
    fn episodes_are_cut_at_their_done_step() -> Result<()> {
        let image = Tensor::full(0.5f32, (2, 6, 3, 8, 8), &Device::Cpu)?;
        let rollout = rollout_batch(done_at_2_and_4(), image)?;
        let boundary = BoundaryInfo::resolve(&rollout.done)?;
        let compiled = compile_episode_data(&rollout, &boundary, 0, 0, 10.)?;
        assert_eq!(compiled.episode_data_index.from, vec![0, 3]);
        assert_eq!(compiled.episode_data_index.to, vec![3, 8]);
        let dataset = &compiled.dataset;
        assert_eq!(dataset.len(), 8);
        assert_eq!(dataset.episode_indices()?, vec![0, 0, 0, 1, 1, 1, 1, 1]);
        assert_eq!(dataset.indices()?, (0..8).collect::<Vec<i64>>());
        let frame_index = dataset.column(FRAME_INDEX).map(|c| c.to_vec1::<i64>());
        assert_eq!(frame_index.transpose()?, Some(vec![0, 1, 2, 0, 1, 2, 3, 4]));
        let done = dataset.column(NEXT_DONE).map(|c| c.to_vec1::<u8>());
        assert_eq!(done.transpose()?, Some(vec![0, 0, 1, 0, 0, 0, 0, 1]));
        let timestamp = dataset.column(TIMESTAMP).map(|c| c.to_vec1::<f32>());
        assert_eq!(timestamp.transpose()?.map(|t| t[2]), Some(0.2));
        let image = dataset.column("observation.image").map(|c| c.dims().to_vec());
        assert_eq!(image, Some(vec![8, 8, 8, 3]));
        let image = dataset.column("observation.image").map(|c| c.dtype());
        assert_eq!(image, Some(DType::U8));
        Ok(())
    }

    #[test]
    fn offsets_continue_previous_batches() -> Result<()> {
        let image = Tensor::zeros((2, 6, 3, 8, 8), DType::F32, &Device::Cpu)?;
        let rollout = rollout_batch(done_at_2_and_4(), image)?;
        let boundary = BoundaryInfo::resolve(&rollout.done)?;
        let first = compile_episode_data(&rollout, &boundary, 0, 0, 10.)?;
        let second = compile_episode_data(&rollout, &boundary, 2, 8, 10.)?;
        assert_eq!(second.episode_data_index.from, vec![8, 11]);
        let both = first.concat(&second)?;
        assert_eq!(both.num_episodes(), 4);
        both.episode_data_index.validate_contiguous(both.num_frames())?;
        // replaying the first batch does not continue it
        assert!(matches!(first.concat(&first), Err(RollmixError::Validation(_))));
        Ok(())
    }

    #[test]
    fn out_of_range_pixels_are_rejected() -> Result<()> {
        let image = Tensor::full(1.5f32, (2, 6, 3, 8, 8), &Device::Cpu)?;
        let rollout = rollout_batch(done_at_2_and_4(), image)?;
        let boundary = BoundaryInfo::resolve(&rollout.done)?;
        assert!(matches!(
            compile_episode_data(&rollout, &boundary, 0, 0, 10.),
            Err(RollmixError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn flat_done_flags_are_rejected() -> Result<()> {
        let image = Tensor::zeros((2, 6, 3, 8, 8), DType::F32, &Device::Cpu)?;
        let rollout = rollout_batch(done_at_2_and_4(), image)?;
        let boundary = BoundaryInfo::resolve(&rollout.done)?;
        let flat = RolloutBatch {
            done: rollout.done.flatten_all()?,
            ..rollout
        };
        assert!(matches!(
            compile_episode_data(&flat, &boundary, 0, 0, 10.),
            Err(RollmixError::Validation(_))
        ));
        assert!(matches!(flat.take_episodes(1), Err(RollmixError::Validation(_))));
        Ok(())
    }

    #[test]
    fn channel_last_images_are_rejected() -> Result<()> {
        let image = Tensor::zeros((2, 6, 8, 8, 3), DType::F32, &Device::Cpu)?;
        let rollout = rollout_batch(done_at_2_and_4(), image)?;
        let boundary = BoundaryInfo::resolve(&rollout.done)?;
        assert!(compile_episode_data(&rollout, &boundary, 0, 0, 10.).is_err());
        Ok(())
    }
}
