use super::{EpisodeDataIndex, EpisodeDataset};
use crate::{
    episodes::CompiledEpisodes,
    error::{Result, RollmixError},
};
use candle_core::{DType, Device, Tensor};
use std::{collections::HashMap, path::Path};

const INDEX_FROM: &str = "__episode_data_index.from";
const INDEX_TO: &str = "__episode_data_index.to";

/// Writes the columns of `dataset` and its episode ranges into a single safetensors file.
pub fn save_episodes(
    dataset: &EpisodeDataset,
    episode_data_index: &EpisodeDataIndex,
    path: impl AsRef<Path>,
) -> Result<()> {
    let mut tensors: HashMap<String, Tensor> = dataset
        .columns()
        .iter()
        .map(|(name, column)| (name.clone(), column.clone()))
        .collect();
    for (key, bounds) in [
        (INDEX_FROM, &episode_data_index.from),
        (INDEX_TO, &episode_data_index.to),
    ] {
        let bounds = bounds.iter().map(|b| *b as i64).collect::<Vec<_>>();
        let len = bounds.len();
        tensors.insert(key.to_owned(), Tensor::from_vec(bounds, len, &Device::Cpu)?);
    }
    candle_core::safetensors::save(&tensors, path.as_ref())?;
    tracing::debug!(path = %path.as_ref().display(), frames = dataset.len(), "saved episodes");
    Ok(())
}

/// Reads back a file written by [`save_episodes`], re-deriving the schema from the columns.
pub fn load_episodes(path: impl AsRef<Path>) -> Result<CompiledEpisodes> {
    let mut tensors = candle_core::safetensors::load(path.as_ref(), &Device::Cpu)?;
    let mut bounds = |key: &str| -> Result<Vec<usize>> {
        let tensor = tensors.remove(key).ok_or_else(|| {
            RollmixError::Validation(format!("{} has no `{key}` tensor", path.as_ref().display()))
        })?;
        Ok(tensor
            .to_dtype(DType::I64)?
            .to_vec1::<i64>()?
            .into_iter()
            .map(|b| b as usize)
            .collect())
    };
    let episode_data_index = EpisodeDataIndex {
        from: bounds(INDEX_FROM)?,
        to: bounds(INDEX_TO)?,
    };
    let dataset = EpisodeDataset::from_columns(tensors.into_iter().collect())?;
    episode_data_index.validate_contiguous(dataset.len())?;
    Ok(CompiledEpisodes {
        dataset,
        episode_data_index,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::synthetic_episodes;

    #[test]
    fn round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("online.safetensors");
        let episodes = synthetic_episodes(&[3, 2])?;
        save_episodes(&episodes.dataset, &episodes.episode_data_index, &path)?;
        let loaded = load_episodes(&path)?;
        assert_eq!(loaded.episode_data_index, episodes.episode_data_index);
        assert_eq!(loaded.dataset.features(), episodes.dataset.features());
        assert_eq!(loaded.dataset.indices()?, episodes.dataset.indices()?);
        Ok(())
    }
}
