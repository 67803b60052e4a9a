//! Vector similarity and summary statistics.
//!
//! Percentiles follow PostgreSQL `percentile_cont` semantics (linear
//! interpolation between the two nearest ranks), so a band computed here
//! matches one computed server-side over the same values.

/// Euclidean norm of a vector.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity given precomputed norms. Zero vectors yield 0.
pub fn cosine_with_norms(a: &[f32], b: &[f32], norm_a: f32, norm_b: f32) -> f32 {
    if a.len() != b.len() || norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (norm_a * norm_b)
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_with_norms(a, b, norm(a), norm(b))
}

/// Clamp a similarity into `[0, 1]`, absorbing floating-point overshoot.
pub fn clamp_unit(similarity: f32) -> f32 {
    if similarity.is_nan() {
        return 0.0;
    }
    similarity.clamp(0.0, 1.0)
}

/// Continuous percentile of an ascending slice; `p` is a fraction in `[0, 1]`.
pub fn percentile_cont(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 1.0);
    let pos = p * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

/// Sort values ascending, dropping NaNs.
pub fn sorted_values(values: impl IntoIterator<Item = f64>) -> Vec<f64> {
    let mut v: Vec<f64> = values.into_iter().filter(|x| !x.is_nan()).collect();
    v.sort_by(f64::total_cmp);
    v
}

/// Arithmetic mean.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (`stddev_samp`); 0 for a single value.
pub fn stddev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    if values.len() < 2 {
        return Some(0.0);
    }
    let var = values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_vectors() {
        let v = [0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_vectors() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_dimension_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_clamp_unit() {
        assert_eq!(clamp_unit(1.000_001), 1.0);
        assert_eq!(clamp_unit(-0.2), 0.0);
        assert_eq!(clamp_unit(0.42), 0.42);
        assert_eq!(clamp_unit(f32::NAN), 0.0);
    }

    #[test]
    fn test_percentile_cont_matches_postgres() {
        // SELECT percentile_cont(0.25) WITHIN GROUP (ORDER BY v)
        // FROM unnest(ARRAY[1,2,3,4]) v;  -> 1.75
        let v = [1.0, 2.0, 3.0, 4.0];
        assert!((percentile_cont(&v, 0.25).unwrap() - 1.75).abs() < 1e-12);
        assert_eq!(percentile_cont(&v, 0.0), Some(1.0));
        assert_eq!(percentile_cont(&v, 1.0), Some(4.0));
    }

    #[test]
    fn test_percentile_cont_single_and_empty() {
        assert_eq!(percentile_cont(&[0.3], 0.9), Some(0.3));
        assert_eq!(percentile_cont(&[], 0.5), None);
    }

    #[test]
    fn test_sorted_values_drops_nan() {
        let v = sorted_values(vec![0.3, f64::NAN, 0.1, 0.2]);
        assert_eq!(v, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_mean_and_stddev() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&v), Some(5.0));
        // sample stddev = sqrt(32 / 7)
        assert!((stddev(&v).unwrap() - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
        assert_eq!(stddev(&[1.0]), Some(0.0));
        assert_eq!(mean(&[]), None);
    }
}
