use log::*;
use std::time::Instant;

/// Factor applied to the threshold after each attempt that found too few points.
pub const SHRINK_FACTOR: f64 = 2.0 / 3.0;

/// Lowers a detector threshold until enough keypoints are found.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveThreshold {
    pub initial: f64,
    pub floor: f64,
    pub shrink: f64,
}

/// Outcome of an adaptive search.
#[derive(Debug, Clone)]
pub struct SearchResult<T> {
    pub threshold: f64,
    pub iterations: usize,
    pub detections: Vec<T>,
}

impl AdaptiveThreshold {
    pub fn new(initial: f64, floor: f64) -> Self {
        Self {
            initial,
            floor,
            shrink: SHRINK_FACTOR,
        }
    }

    /// Upper bound on the number of detection attempts.
    ///
    /// This is the number of shrink steps needed to go from the initial threshold
    /// to the floor, plus the first attempt.
    pub fn max_iterations(&self) -> usize {
        let shrinks = self.shrink > 0.0 && self.shrink < 1.0;
        let bounded = self.initial.is_finite() && self.initial > self.floor && self.floor > 0.0;
        if !bounded || !shrinks {
            return 1;
        }
        let steps = ((self.floor / self.initial).ln() / self.shrink.ln()).ceil();
        (steps as usize).saturating_add(1)
    }

    /// Run `detect` at decreasing thresholds.
    ///
    /// Stops as soon as at least `target` detections are found, the threshold is no
    /// longer above the floor, or the iteration bound is reached.
    pub fn search<T>(
        &self,
        target: usize,
        mut detect: impl FnMut(f64) -> Vec<T>,
    ) -> SearchResult<T> {
        let max_iterations = self.max_iterations();
        let mut threshold = self.initial;
        let mut iterations = 0;
        loop {
            let start = Instant::now();
            let detections = detect(threshold);
            iterations += 1;
            debug!(
                "Found {} points in {:.3}s with threshold {}",
                detections.len(),
                start.elapsed().as_secs_f64(),
                threshold
            );
            if detections.len() >= target
                || threshold <= self.floor
                || iterations >= max_iterations
            {
                return SearchResult {
                    threshold,
                    iterations,
                    detections,
                };
            }
            threshold *= self.shrink;
            debug!("Reducing threshold to {}", threshold);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_when_target_is_met() {
        let search = AdaptiveThreshold::new(0.1, 1e-4);
        let result = search.search(5, |_| vec![(); 10]);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.threshold, 0.1);
    }

    #[test]
    fn shrinks_until_enough_points() {
        let search = AdaptiveThreshold::new(1.0, 1e-4);
        // Points appear once the threshold drops below 0.3.
        let result = search.search(3, |t| if t < 0.3 { vec![(); 3] } else { vec![] });
        assert_eq!(result.detections.len(), 3);
        assert!(result.threshold < 0.3);
        assert!(result.threshold / SHRINK_FACTOR >= 0.3);
    }

    #[test]
    fn terminates_within_bound_on_empty_images() {
        let search = AdaptiveThreshold::new(0.1, 1e-4);
        let mut calls = 0;
        let result = search.search(usize::MAX, |_| {
            calls += 1;
            Vec::<()>::new()
        });
        assert_eq!(calls, result.iterations);
        assert!(result.iterations <= search.max_iterations());
        assert_eq!(search.max_iterations(), 19);
    }

    #[test]
    fn single_attempt_at_or_below_floor() {
        for initial in [1e-4, 1e-6, 0.0, f64::NAN, f64::INFINITY] {
            let search = AdaptiveThreshold::new(initial, 1e-4);
            assert_eq!(search.max_iterations(), 1);
            assert_eq!(search.search(100, |_| Vec::<()>::new()).iterations, 1);
        }
    }

    #[test]
    fn tiny_floor_is_bounded() {
        let search = AdaptiveThreshold::new(f64::MAX, f64::MIN_POSITIVE);
        assert!(search.max_iterations() > 1);
        assert!(search.max_iterations() < 10_000);
    }
}
