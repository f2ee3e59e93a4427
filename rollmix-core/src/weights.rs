use crate::error::{Result, RollmixError};
use crate::ensure_valid;

/// Weight to give every online sample so that a weighted sampler draws online samples with
/// probability `pc_online_samples`, offline samples having a weight of 1.
///
/// Solves `n_on * w / (n_off + n_on * w) = pc` for `w`.
pub fn calculate_online_sample_weight(
    n_off: usize,
    n_on: usize,
    pc_online_samples: f64,
) -> Result<f64> {
    ensure_valid!(
        (0.0..=1.0).contains(&pc_online_samples),
        "online sample fraction must be in [0, 1], got {pc_online_samples}"
    );
    if n_on == 0 {
        return Err(RollmixError::ArithmeticDegenerate(
            "cannot weight online samples when there are none".to_owned(),
        ));
    }
    if pc_online_samples == 1.0 {
        if n_off == 0 {
            return Ok(1.0);
        }
        return Err(RollmixError::ArithmeticDegenerate(format!(
            "an online fraction of 1 cannot be reached with {n_off} offline samples"
        )));
    }
    if pc_online_samples == 0.0 {
        return Ok(0.0);
    }
    Ok(-(n_off as f64 * pc_online_samples) / (n_on as f64 * (pc_online_samples - 1.0)))
}

#[cfg(test)]
mod test {
    use super::*;

    fn online_fraction(n_off: usize, n_on: usize, w: f64) -> f64 {
        n_on as f64 * w / (n_off as f64 + n_on as f64 * w)
    }

    #[test]
    fn even_mix() -> Result<()> {
        let w = calculate_online_sample_weight(100, 50, 0.5)?;
        assert!((w - 2.0).abs() < 1e-12);
        assert!((online_fraction(100, 50, w) - 0.5).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn hits_the_target_fraction() -> Result<()> {
        for (n_off, n_on, pc) in [(1000, 3, 0.25), (7, 400, 0.9), (1, 1, 0.01)] {
            let w = calculate_online_sample_weight(n_off, n_on, pc)?;
            assert!((online_fraction(n_off, n_on, w) - pc).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn edge_fractions() -> Result<()> {
        assert_eq!(calculate_online_sample_weight(10, 5, 0.0)?, 0.0);
        assert_eq!(calculate_online_sample_weight(0, 5, 1.0)?, 1.0);
        assert!(matches!(
            calculate_online_sample_weight(10, 5, 1.0),
            Err(RollmixError::ArithmeticDegenerate(_))
        ));
        assert!(matches!(
            calculate_online_sample_weight(10, 0, 0.5),
            Err(RollmixError::ArithmeticDegenerate(_))
        ));
        assert!(matches!(
            calculate_online_sample_weight(10, 5, 1.5),
            Err(RollmixError::Validation(_))
        ));
        Ok(())
    }
}
