//! Randomized pacing between remote calls
//!
//! Fixed intervals between calls are easy to fingerprint, so every deliberate
//! pause in the crate is drawn from a range.

use std::time::Duration;

use rand::Rng;

/// Uniform sample in `[min, max]`; returns `min` when the range is empty
pub fn uniform(min: f64, max: f64) -> f64 {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

/// Triangular sample over `[low, high]` peaking at `mode`
pub fn triangular(low: f64, high: f64, mode: f64) -> f64 {
    if high <= low {
        return low;
    }
    let u: f64 = rand::thread_rng().gen();
    let split = (mode - low) / (high - low);
    if u < split {
        low + (u * (high - low) * (mode - low)).sqrt()
    } else {
        high - ((1.0 - u) * (high - low) * (high - mode)).sqrt()
    }
}

pub fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// Suspend for a uniformly drawn number of seconds
pub async fn random_sleep(min_secs: f64, max_secs: f64) {
    tokio::time::sleep(secs(uniform(min_secs, max_secs))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_bounds() {
        for _ in 0..1000 {
            let v = uniform(0.3, 0.5);
            assert!((0.3..=0.5).contains(&v));
        }
        assert_eq!(uniform(2.0, 2.0), 2.0);
    }

    #[test]
    fn test_triangular_bounds() {
        for _ in 0..1000 {
            let v = triangular(1.25, 4.0, 2.0);
            assert!((1.25..=4.0).contains(&v), "out of range: {}", v);
        }
    }

    #[test]
    fn test_secs_clamps_negative() {
        assert_eq!(secs(-1.0), Duration::ZERO);
    }
}
