pub mod index;
pub mod online;
pub mod storage;

pub use index::EpisodeDataIndex;
pub use online::{ConcatDataset, MixedDataset, OnlineDataset, WeightedSampler, add_episodes_inplace};

use crate::{
    ensure_valid,
    error::{Result, RollmixError},
    observation::is_image_key,
};
use candle_core::{DType, Tensor};
use derive_more::{Deref, DerefMut};
use std::{collections::BTreeMap, fmt, sync::Arc};

pub const ACTION: &str = "action";
pub const EPISODE_INDEX: &str = "episode_index";
pub const FRAME_INDEX: &str = "frame_index";
pub const TIMESTAMP: &str = "timestamp";
pub const NEXT_DONE: &str = "next.done";
pub const NEXT_REWARD: &str = "next.reward";
pub const INDEX: &str = "index";

/// Type of a single frame's value in a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureType {
    Value(DType),
    Sequence { length: usize, dtype: DType },
    /// u8 channel last `(h, w, c)` frames.
    Image,
}

impl FeatureType {
    /// Derives the feature type of a `(frames, ..)` column.
    pub fn infer(name: &str, column: &Tensor) -> Result<Self> {
        match column.dims() {
            [_] => Ok(Self::Value(column.dtype())),
            [_, length] => Ok(Self::Sequence {
                length: *length,
                dtype: column.dtype(),
            }),
            [_, _, _, _] if is_image_key(name) && column.dtype() == DType::U8 => Ok(Self::Image),
            dims => Err(RollmixError::Validation(format!(
                "column `{name}` with shape {dims:?} and dtype {:?} has no feature type",
                column.dtype()
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, DerefMut)]
pub struct Features(pub BTreeMap<String, FeatureType>);

impl Features {
    pub fn infer(columns: &BTreeMap<String, Tensor>) -> Result<Self> {
        columns
            .iter()
            .map(|(name, column)| Ok((name.clone(), FeatureType::infer(name, column)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Self)
    }
}

/// One frame of a dataset, keyed by column.
#[derive(Debug, Clone, Default, Deref, DerefMut)]
pub struct Item(pub BTreeMap<String, Tensor>);

pub type DecodeTransform = Arc<dyn Fn(Item) -> Result<Item> + Send + Sync>;

/// Column oriented frames of one or more episodes, every column holding one row per frame.
#[derive(Clone, Default)]
pub struct EpisodeDataset {
    columns: BTreeMap<String, Tensor>,
    features: Features,
    len: usize,
    transform: Option<DecodeTransform>,
}

impl fmt::Debug for EpisodeDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpisodeDataset")
            .field("len", &self.len)
            .field("features", &self.features)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl EpisodeDataset {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_columns(columns: BTreeMap<String, Tensor>) -> Result<Self> {
        let len = match columns.values().next() {
            Some(column) => column.dims().first().copied().unwrap_or(0),
            None => 0,
        };
        for (name, column) in &columns {
            ensure_valid!(
                column.rank() > 0 && column.dims()[0] == len,
                "column `{name}` has shape {:?}, expected {len} rows",
                column.dims()
            );
        }
        let features = Features::infer(&columns)?;
        Ok(Self {
            columns,
            features,
            len,
            transform: None,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn column(&self, name: &str) -> Option<&Tensor> {
        self.columns.get(name)
    }

    pub fn columns(&self) -> &BTreeMap<String, Tensor> {
        &self.columns
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn episode_indices(&self) -> Result<Vec<i64>> {
        self.i64_column(EPISODE_INDEX)
    }

    pub fn indices(&self) -> Result<Vec<i64>> {
        self.i64_column(INDEX)
    }

    /// First and last value of an integer column, `None` for an empty dataset.
    pub fn first_and_last(&self, name: &str) -> Result<Option<(i64, i64)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let values = self.i64_column(name)?;
        Ok(values.first().copied().zip(values.last().copied()))
    }

    pub fn num_episodes(&self) -> Result<usize> {
        let mut episodes = self.episode_indices()?;
        episodes.dedup();
        Ok(episodes.len())
    }

    /// Sets the transform applied to every item returned by [`Self::get`].
    pub fn set_transform(&mut self, transform: DecodeTransform) {
        self.transform = Some(transform);
    }

    pub fn get(&self, idx: usize) -> Result<Item> {
        ensure_valid!(
            idx < self.len,
            "index {idx} is out of bounds for a dataset of {} frames",
            self.len
        );
        let item = self
            .columns
            .iter()
            .map(|(name, column)| Ok((name.clone(), column.get(idx)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Item)?;
        match &self.transform {
            Some(transform) => transform(item),
            None => Ok(item),
        }
    }

    /// Appends the frames of `other`. Both datasets must share their schema unless one is empty.
    pub fn concat(&self, other: &Self) -> Result<Self> {
        if other.is_empty() {
            return Ok(self.clone());
        }
        if self.is_empty() {
            let mut concatenated = other.clone();
            if self.transform.is_some() {
                concatenated.transform = self.transform.clone();
            }
            return Ok(concatenated);
        }
        ensure_valid!(
            self.features == other.features,
            "cannot concatenate datasets with different features: {:?} and {:?}",
            self.features,
            other.features
        );
        let columns = self
            .columns
            .iter()
            .map(|(name, column)| {
                let tail = &other.columns[name];
                Ok((name.clone(), Tensor::cat(&[column, tail], 0)?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            columns,
            features: self.features.clone(),
            len: self.len + other.len,
            transform: self.transform.clone(),
        })
    }

    /// Returns a copy with `episode_offset` added to every episode index and `index_offset` to
    /// every global index.
    pub fn shift_indices(&self, episode_offset: i64, index_offset: i64) -> Result<Self> {
        let mut shifted = self.clone();
        for (name, offset) in [(EPISODE_INDEX, episode_offset), (INDEX, index_offset)] {
            let values = self
                .i64_column(name)?
                .into_iter()
                .map(|value| value + offset)
                .collect::<Vec<_>>();
            let column = Tensor::from_vec(values, self.len, self.columns[name].device())?;
            shifted.columns.insert(name.to_owned(), column);
        }
        Ok(shifted)
    }

    fn i64_column(&self, name: &str) -> Result<Vec<i64>> {
        let column = self.columns.get(name).ok_or_else(|| {
            RollmixError::Validation(format!("dataset has no `{name}` column"))
        })?;
        Ok(column.to_dtype(DType::I64)?.to_vec1::<i64>()?)
    }
}

/// Decode transform turning stored u8 channel last images into f32 channel first ones in
/// `[0, 1]`.
pub fn images_to_float_chw(mut item: Item) -> Result<Item> {
    for (name, value) in item.iter_mut() {
        if is_image_key(name) && value.rank() == 3 && value.dtype() == DType::U8 {
            *value = value
                .permute((2, 0, 1))?
                .to_dtype(DType::F32)?
                .affine(1. / 255., 0.)?
                .contiguous()?;
        }
    }
    Ok(item)
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::Device;

    fn frames(episode_index: &[i64], index: &[i64]) -> Result<EpisodeDataset> {
        let n = index.len();
        let mut columns = BTreeMap::new();
        columns.insert(
            EPISODE_INDEX.to_owned(),
            Tensor::from_vec(episode_index.to_vec(), n, &Device::Cpu)?,
        );
        columns.insert(INDEX.to_owned(), Tensor::from_vec(index.to_vec(), n, &Device::Cpu)?);
        columns.insert(ACTION.to_owned(), Tensor::zeros((n, 2), DType::F32, &Device::Cpu)?);
        columns.insert(
            "observation.image".to_owned(),
            Tensor::full(255u8, (n, 4, 6, 3), &Device::Cpu)?,
        );
        EpisodeDataset::from_columns(columns)
    }

    #[test]
    fn schema_is_inferred() -> Result<()> {
        let dataset = frames(&[0, 0, 1], &[0, 1, 2])?;
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.num_episodes()?, 2);
        assert_eq!(dataset.features()[INDEX], FeatureType::Value(DType::I64));
        assert_eq!(
            dataset.features()[ACTION],
            FeatureType::Sequence {
                length: 2,
                dtype: DType::F32
            }
        );
        assert_eq!(dataset.features()["observation.image"], FeatureType::Image);
        Ok(())
    }

    #[test]
    fn shifting_is_pure() -> Result<()> {
        let dataset = frames(&[0, 0, 1], &[0, 1, 2])?;
        let shifted = dataset.shift_indices(3, 10)?;
        assert_eq!(shifted.episode_indices()?, vec![3, 3, 4]);
        assert_eq!(shifted.indices()?, vec![10, 11, 12]);
        assert_eq!(dataset.indices()?, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn concat_checks_the_schema() -> Result<()> {
        let a = frames(&[0], &[0])?;
        let b = frames(&[1, 1], &[1, 2])?;
        let both = a.concat(&b)?;
        assert_eq!(both.indices()?, vec![0, 1, 2]);
        assert_eq!(EpisodeDataset::empty().concat(&a)?.len(), 1);

        let mut columns = b.columns().clone();
        columns.remove(ACTION);
        let other = EpisodeDataset::from_columns(columns)?;
        assert!(matches!(a.concat(&other), Err(RollmixError::Validation(_))));
        Ok(())
    }

    #[test]
    fn decode_transform_applies_on_get() -> Result<()> {
        let mut dataset = frames(&[0, 0], &[0, 1])?;
        assert_eq!(dataset.get(1)?["observation.image"].dims(), &[4, 6, 3]);
        dataset.set_transform(Arc::new(images_to_float_chw));
        let item = dataset.get(1)?;
        let image = &item["observation.image"];
        assert_eq!(image.dims(), &[3, 4, 6]);
        assert_eq!(image.max_all()?.to_scalar::<f32>()?, 1.0);
        assert_eq!(item[INDEX].to_scalar::<i64>()?, 1);
        assert!(dataset.get(2).is_err());
        Ok(())
    }
}
