use crate::{ensure_valid, error::Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Global frame range `from[i]..to[i]` of every episode of a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeDataIndex {
    pub from: Vec<usize>,
    pub to: Vec<usize>,
}

impl EpisodeDataIndex {
    /// Derives the ranges of a zero based `episode_index` column whose episodes are numbered
    /// `0..n` and stored one after the other.
    pub fn from_episode_column(episode_indices: &[i64]) -> Result<Self> {
        let mut index = Self::default();
        for (row, episode) in episode_indices.iter().enumerate() {
            let current = index.len() as i64 - 1;
            if *episode == current {
                continue;
            }
            ensure_valid!(
                *episode == current + 1,
                "frame {row} belongs to episode {episode}, expected episode {} or {}",
                current,
                current + 1
            );
            if let Some(to) = index.to.last_mut() {
                *to = row;
            }
            index.push(row, row);
        }
        if let Some(to) = index.to.last_mut() {
            *to = episode_indices.len();
        }
        Ok(index)
    }

    pub fn push(&mut self, from: usize, to: usize) {
        self.from.push(from);
        self.to.push(to);
    }

    pub fn len(&self) -> usize {
        self.from.len()
    }

    pub fn is_empty(&self) -> bool {
        self.from.is_empty()
    }

    pub fn range(&self, episode: usize) -> Range<usize> {
        self.from[episode]..self.to[episode]
    }

    pub fn first_from(&self) -> Option<usize> {
        self.from.first().copied()
    }

    pub fn last_to(&self) -> Option<usize> {
        self.to.last().copied()
    }

    pub fn total_frames(&self) -> usize {
        match (self.first_from(), self.last_to()) {
            (Some(from), Some(to)) => to - from,
            _ => 0,
        }
    }

    pub fn shifted(&self, offset: usize) -> Self {
        Self {
            from: self.from.iter().map(|from| from + offset).collect(),
            to: self.to.iter().map(|to| to + offset).collect(),
        }
    }

    /// Appends `other`, whose first range must start where this one ends.
    pub fn concat(&self, other: &Self) -> Result<Self> {
        if let (Some(to), Some(from)) = (self.last_to(), other.first_from()) {
            ensure_valid!(
                to == from,
                "episode ranges are not contiguous: previous ends at {to}, next starts at {from}"
            );
        }
        let mut concatenated = self.clone();
        concatenated.from.extend_from_slice(&other.from);
        concatenated.to.extend_from_slice(&other.to);
        Ok(concatenated)
    }

    /// Checks that the ranges partition `[0, total_frames)`.
    pub fn validate_contiguous(&self, total_frames: usize) -> Result<()> {
        ensure_valid!(
            self.from.len() == self.to.len(),
            "episode index has {} starts and {} ends",
            self.from.len(),
            self.to.len()
        );
        let mut expected_from = 0;
        for (episode, (from, to)) in self.from.iter().zip(&self.to).enumerate() {
            ensure_valid!(
                *from == expected_from && from < to,
                "episode {episode} spans {from}..{to}, expected a non empty range from {expected_from}"
            );
            expected_from = *to;
        }
        ensure_valid!(
            expected_from == total_frames,
            "episode ranges cover {expected_from} frames out of {total_frames}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn concat_requires_contiguous_ranges() -> Result<()> {
        let mut a = EpisodeDataIndex::default();
        a.push(0, 3);
        let mut b = EpisodeDataIndex::default();
        b.push(3, 8);
        let ab = a.concat(&b)?;
        assert_eq!(ab.range(1), 3..8);
        assert_eq!(ab.total_frames(), 8);
        ab.validate_contiguous(8)?;
        assert!(ab.validate_contiguous(9).is_err());
        assert!(a.concat(&b.shifted(1)).is_err());
        Ok(())
    }

    #[test]
    fn ranges_follow_the_episode_column() -> Result<()> {
        let index = EpisodeDataIndex::from_episode_column(&[0, 0, 1, 2, 2, 2])?;
        assert_eq!(index.from, vec![0, 2, 3]);
        assert_eq!(index.to, vec![2, 3, 6]);
        assert!(EpisodeDataIndex::from_episode_column(&[])?.is_empty());
        // gaps, episodes out of order and episodes split in two
        assert!(EpisodeDataIndex::from_episode_column(&[0, 2]).is_err());
        assert!(EpisodeDataIndex::from_episode_column(&[1, 1]).is_err());
        assert!(EpisodeDataIndex::from_episode_column(&[0, 1, 0]).is_err());
        Ok(())
    }

    #[test]
    fn serializes_as_from_to_lists() {
        let mut index = EpisodeDataIndex::default();
        index.push(0, 2);
        let json = serde_json::to_string(&index).unwrap();
        assert_eq!(json, r#"{"from":[0],"to":[2]}"#);
    }
}
