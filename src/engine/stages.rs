use tokio::time::Duration;

use crate::error::ConfigError;

/// One step of a ramp profile: move to `target` VUs over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Target concurrency over time for an ordered list of stages.
#[derive(Debug, Clone)]
pub struct StagePlan {
    start_target: usize,
    stages: Vec<Stage>,
    total: Duration,
}

impl StagePlan {
    pub fn new(start_target: usize, stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        let total = stages
            .iter()
            .try_fold(Duration::ZERO, |acc, s| acc.checked_add(s.duration))
            .ok_or(ConfigError::StagesTooLong)?;
        Ok(Self {
            start_target,
            stages,
            total,
        })
    }

    /// A flat profile: `vus` users for `duration`.
    pub fn constant(vus: usize, duration: Duration) -> Self {
        Self {
            start_target: vus,
            stages: vec![Stage::new(duration, vus)],
            total: duration,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn start_target(&self) -> usize {
        self.start_target
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Run termination is signaled once every stage has elapsed.
    pub fn is_finished(&self, elapsed: Duration) -> bool {
        elapsed >= self.total
    }

    /// Peak concurrency across the whole plan.
    pub fn max_target(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.target)
            .chain(std::iter::once(self.start_target))
            .max()
            .unwrap_or(0)
    }

    /// Target VU count at `elapsed`, linearly interpolated between the end
    /// of the previous stage and the end of the active one. Fractions round
    /// toward the lower of the two boundary targets.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        let mut stage_start = Duration::ZERO;
        let mut from = self.start_target;
        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                return interpolate(from, stage.target, progress);
            }
            stage_start = stage_end;
            from = stage.target;
        }
        0
    }
}

fn interpolate(from: usize, to: usize, progress: f64) -> usize {
    let progress = progress.clamp(0.0, 1.0);
    if to >= from {
        from + ((to - from) as f64 * progress).floor() as usize
    } else {
        // Ramping down: drop a VU only once a whole step has passed.
        to + ((from - to) as f64 * (1.0 - progress)).floor() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn reference_plan() -> StagePlan {
        StagePlan::new(
            0,
            vec![
                Stage::new(secs(10), 50),
                Stage::new(secs(20), 50),
                Stage::new(secs(5), 0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_ramp_up_hold_ramp_down() {
        let plan = reference_plan();
        assert_eq!(plan.target_at(Duration::ZERO), 0);
        assert_eq!(plan.target_at(secs(1)), 5);
        assert_eq!(plan.target_at(secs(5)), 25);
        assert_eq!(plan.target_at(Duration::from_millis(9_999)), 49);
        assert_eq!(plan.target_at(secs(10)), 50);
        assert_eq!(plan.target_at(secs(29)), 50);
        assert_eq!(plan.target_at(secs(30)), 50);
        assert_eq!(plan.target_at(secs(31)), 40);
        assert_eq!(plan.target_at(Duration::from_millis(34_999)), 0);
        assert_eq!(plan.target_at(secs(35)), 0);
        assert_eq!(plan.total_duration(), secs(35));
        assert_eq!(plan.max_target(), 50);
    }

    #[test]
    fn test_finished_after_total() {
        let plan = reference_plan();
        assert!(!plan.is_finished(secs(34)));
        assert!(plan.is_finished(secs(35)));
        assert!(plan.is_finished(secs(100)));
        assert_eq!(plan.target_at(secs(100)), 0);
    }

    #[test]
    fn test_start_target_is_used_at_zero() {
        let plan = StagePlan::new(10, vec![Stage::new(secs(10), 20)]).unwrap();
        assert_eq!(plan.target_at(Duration::ZERO), 10);
        assert_eq!(plan.target_at(secs(5)), 15);
        assert_eq!(plan.max_target(), 20);
    }

    #[test]
    fn test_zero_duration_stage_jumps() {
        let plan = StagePlan::new(
            0,
            vec![Stage::new(Duration::ZERO, 30), Stage::new(secs(10), 30)],
        )
        .unwrap();
        assert_eq!(plan.target_at(Duration::ZERO), 30);
        assert_eq!(plan.target_at(secs(3)), 30);
    }

    #[test]
    fn test_constant_plan() {
        let plan = StagePlan::constant(7, secs(30));
        assert_eq!(plan.target_at(Duration::ZERO), 7);
        assert_eq!(plan.target_at(secs(29)), 7);
        assert!(plan.is_finished(secs(30)));
    }

    #[test]
    fn test_empty_stages_rejected() {
        assert!(matches!(
            StagePlan::new(0, vec![]),
            Err(ConfigError::NoStages)
        ));
    }

    #[test]
    fn test_overflowing_total_rejected() {
        let huge = Duration::from_secs(u64::MAX / 2 + 1);
        assert!(matches!(
            StagePlan::new(0, vec![Stage::new(huge, 1), Stage::new(huge, 0)]),
            Err(ConfigError::StagesTooLong)
        ));
    }

    fn stages_strategy() -> impl Strategy<Value = (usize, Vec<(u64, usize)>)> {
        (
            0usize..200,
            prop::collection::vec((0u64..60_000, 0usize..500), 1..8),
        )
    }

    proptest! {
        #[test]
        fn prop_target_follows_linear_interpolation(
            (start, raw) in stages_strategy(),
            fraction in 0.0f64..1.0,
        ) {
            let stages: Vec<Stage> = raw
                .iter()
                .map(|(ms, t)| Stage::new(Duration::from_millis(*ms), *t))
                .collect();
            let plan = StagePlan::new(start, stages.clone()).unwrap();
            let total = plan.total_duration();
            let elapsed = Duration::from_secs_f64(total.as_secs_f64() * fraction);

            // Locate boundaries independently of the implementation.
            let mut begin = Duration::ZERO;
            let mut from = start;
            for stage in &stages {
                let end = begin + stage.duration;
                if elapsed < end {
                    let target = plan.target_at(elapsed);
                    let lo = from.min(stage.target);
                    let hi = from.max(stage.target);
                    prop_assert!(lo <= target && target <= hi,
                        "target {} outside [{}, {}]", target, lo, hi);

                    let progress = (elapsed - begin).as_secs_f64() / stage.duration.as_secs_f64();
                    let exact = from as f64 + (stage.target as f64 - from as f64) * progress;
                    prop_assert!((target as f64 - exact).abs() < 1.0 + 1e-9,
                        "target {} too far from {}", target, exact);
                    break;
                }
                begin = end;
                from = stage.target;
            }
        }

        #[test]
        fn prop_monotonic_within_stage(
            from in 0usize..300,
            to in 0usize..300,
            ms in 1u64..60_000,
            a in 0.0f64..0.999,
            b in 0.0f64..0.999,
        ) {
            let plan = StagePlan::new(from, vec![Stage::new(Duration::from_millis(ms), to)]).unwrap();
            let (early, late) = if a <= b { (a, b) } else { (b, a) };
            let t1 = plan.target_at(Duration::from_secs_f64(ms as f64 / 1000.0 * early));
            let t2 = plan.target_at(Duration::from_secs_f64(ms as f64 / 1000.0 * late));
            if to >= from {
                prop_assert!(t1 <= t2);
            } else {
                prop_assert!(t1 >= t2);
            }
        }
    }
}
