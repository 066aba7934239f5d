//! Uncertainty and codebook usage measures.

/// Guards the logarithm of empty probabilities.
pub const LOG_EPSILON: f64 = 1e-10;

/// The Shannon entropy (in nats) of a probability vector.
pub fn entropy(probs: &[f32]) -> f64 {
    -probs
        .iter()
        .map(|&p| p as f64)
        .filter(|&p| p > 0.)
        .map(|p| p * p.ln())
        .sum::<f64>()
}

/// The entropy of a probability vector divided by the maximal entropy `ln(C)`, which maps it
/// into `[0, 1]`.
///
/// A single class has no uncertainty by definition.
pub fn normalized_entropy(probs: &[f32]) -> f64 {
    if probs.len() < 2 {
        return 0.;
    }
    (entropy(probs) / (probs.len() as f64).ln()).clamp(0., 1.)
}

/// The mean normalized entropy over the rows of a row-major `n × classes` probability matrix.
///
/// Returns `0` for an empty matrix.
pub fn mean_normalized_entropy(probs: &[f32], classes: usize) -> f64 {
    if classes == 0 || probs.is_empty() {
        return 0.;
    }
    let rows = probs.chunks_exact(classes);
    let n = rows.len();
    rows.map(normalized_entropy).sum::<f64>() / n as f64
}

/// The perplexity of the codeword usage given by `counts`, i.e. the effective number of used
/// codewords.
pub fn perplexity(counts: &[usize]) -> f64 {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 1.;
    }
    let total = total as f64;
    let entropy = -counts
        .iter()
        .map(|&c| {
            let p = c as f64 / total;
            p * (p + LOG_EPSILON).ln()
        })
        .sum::<f64>();
    entropy.exp()
}

/// Counts how often each of the `num_codes` codewords is used by the given code indices.
pub fn code_counts(indices: &[u32], num_codes: usize) -> Vec<usize> {
    let mut counts = vec![0; num_codes];
    for &i in indices {
        if let Some(count) = counts.get_mut(i as usize) {
            *count += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_entropy_one_hot() {
        assert_eq!(entropy(&[0., 1., 0.]), 0.);
        assert_eq!(normalized_entropy(&[0., 1., 0.]), 0.);
    }

    #[test]
    fn test_entropy_uniform() {
        let uniform = vec![0.1; 10];
        assert!(approx(entropy(&uniform), 10_f64.ln()));
        assert!(approx(normalized_entropy(&uniform), 1.));
    }

    #[test]
    fn test_mean_normalized_entropy() {
        let probs = vec![1., 0., 0.5, 0.5];
        assert!(approx(mean_normalized_entropy(&probs, 2), 0.5));
        assert_eq!(mean_normalized_entropy(&[], 2), 0.);
    }

    #[test]
    fn test_perplexity() {
        assert!((perplexity(&[5, 5, 5, 5]) - 4.).abs() < 1e-6);
        assert!((perplexity(&[7, 0, 0]) - 1.).abs() < 1e-6);
        assert_eq!(perplexity(&[0, 0]), 1.);
    }

    #[test]
    fn test_code_counts() {
        assert_eq!(code_counts(&[0, 2, 2, 1, 2], 4), vec![1, 1, 3, 0]);
    }
}
