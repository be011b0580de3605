/// Splits a task's declared parallelization between the pipeline's heavy
/// and light stages.
///
/// The two shares sum to the declared maximum, except that each stage gets
/// at least one lane no matter how small the declaration. The floor wins
/// over the sum: a task with `max_parallelization = 1` gets one lane per
/// stage and still makes progress everywhere.
#[derive(Debug, Clone, Copy)]
pub struct ThrottlingFractionEvaluator {
    heavy_fraction: f64,
}

impl Default for ThrottlingFractionEvaluator {
    fn default() -> Self {
        Self { heavy_fraction: 0.4 }
    }
}

impl ThrottlingFractionEvaluator {
    pub fn new(heavy_fraction: f64) -> Self {
        Self {
            heavy_fraction: heavy_fraction.clamp(0.0, 1.0),
        }
    }

    pub fn heavy_lanes(&self, max_parallelization: u32) -> u32 {
        let max = max_parallelization.max(1);
        let heavy = (f64::from(max) * self.heavy_fraction).round() as u32;
        heavy.clamp(1, max.saturating_sub(1).max(1))
    }

    pub fn light_lanes(&self, max_parallelization: u32) -> u32 {
        let max = max_parallelization.max(1);
        max.saturating_sub(self.heavy_lanes(max)).max(1)
    }
}

/// Assigns a record to one of the task's lanes.
///
/// The lane key is `"{task_id}_{lane}"`; every consumer hashing or grouping
/// by this key sees at most `max_lanes` distinct values per task, which is
/// what bounds the task's concurrency downstream.
pub fn lane_key_for(task_id: i64, max_lanes: u32) -> String {
    let lane = fastrand::u32(0..max_lanes.max(1));
    format!("{task_id}_{lane}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_keys_stay_within_the_declared_range() {
        for _ in 0..1_000 {
            let key = lane_key_for(42, 4);
            let (task, lane) = key.split_once('_').unwrap();
            assert_eq!(task, "42");
            assert!(lane.parse::<u32>().unwrap() < 4);
        }
    }

    #[test]
    fn single_lane_tasks_always_map_to_lane_zero() {
        assert_eq!(lane_key_for(7, 1), "7_0");
        assert_eq!(lane_key_for(7, 0), "7_0");
    }

    #[test]
    fn both_stages_keep_at_least_one_lane() {
        let eval = ThrottlingFractionEvaluator::default();
        for max in 2..=64 {
            let heavy = eval.heavy_lanes(max);
            let light = eval.light_lanes(max);
            assert!(heavy >= 1);
            assert!(light >= 1);
            assert_eq!(heavy + light, max);
        }
    }

    #[test]
    fn declared_maximum_of_one_floors_both_stages() {
        // The per-stage floor beats the sum here; each stage gets its lane.
        let eval = ThrottlingFractionEvaluator::default();
        assert_eq!(eval.heavy_lanes(1), 1);
        assert_eq!(eval.light_lanes(1), 1);
        assert_eq!(eval.heavy_lanes(0), 1);
        assert_eq!(eval.light_lanes(0), 1);
    }

    #[test]
    fn shares_follow_the_configured_fraction() {
        let eval = ThrottlingFractionEvaluator::new(0.4);
        assert_eq!(eval.heavy_lanes(10), 4);
        assert_eq!(eval.light_lanes(10), 6);

        let eval = ThrottlingFractionEvaluator::new(1.0);
        // The light stage never starves entirely.
        assert_eq!(eval.heavy_lanes(10), 9);
        assert_eq!(eval.light_lanes(10), 1);
    }
}
