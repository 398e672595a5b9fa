use std::sync::Arc;
use std::sync::atomic::Ordering;

use db::models::BuildID;

use super::Step;

/// Per-pass snapshot of one dispatch candidate. The dispatcher sorts on
/// these frozen values so every comparison within a pass sees the same
/// priorities and share usage, even while builder workers mutate the live
/// step state.
pub struct StepInfo {
    pub step: Arc<Step>,
    highest_global_priority: i32,
    highest_local_priority: i32,
    lowest_build_id: BuildID,
    lowest_share_used: f64,
    runnable_since: jiff::Timestamp,
}

impl StepInfo {
    pub fn new(step: Arc<Step>) -> Self {
        Self {
            highest_global_priority: step
                .atomic_state
                .highest_global_priority
                .load(Ordering::Relaxed),
            highest_local_priority: step
                .atomic_state
                .highest_local_priority
                .load(Ordering::Relaxed),
            lowest_build_id: step.atomic_state.lowest_build_id.load(Ordering::Relaxed),
            lowest_share_used: step.get_lowest_share_used(),
            runnable_since: step.get_runnable_since(),
            step,
        }
    }

    /// Dispatch order: global priority first, then fairness (least share
    /// used wins), then local priority, then FIFO by originating build id,
    /// then by how long the step has been waiting.
    pub fn compare(&self, other: &Self) -> std::cmp::Ordering {
        other
            .highest_global_priority
            .cmp(&self.highest_global_priority)
            .then_with(|| {
                self.lowest_share_used
                    .total_cmp(&other.lowest_share_used)
            })
            .then_with(|| {
                other
                    .highest_local_priority
                    .cmp(&self.highest_local_priority)
            })
            .then_with(|| self.lowest_build_id.cmp(&other.lowest_build_id))
            .then_with(|| self.runnable_since.cmp(&other.runnable_since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Jobset;

    struct TestStep {
        global: i32,
        local: i32,
        build_id: BuildID,
        share_used: f64,
    }

    impl Default for TestStep {
        fn default() -> Self {
            Self {
                global: 0,
                local: 0,
                build_id: 1,
                share_used: 1.0,
            }
        }
    }

    impl TestStep {
        fn build(self) -> StepInfo {
            let step = Step::new(store::StorePath::new(
                "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-test.recipe",
            ));
            step.atomic_state
                .highest_global_priority
                .store(self.global, Ordering::Relaxed);
            step.atomic_state
                .highest_local_priority
                .store(self.local, Ordering::Relaxed);
            step.atomic_state
                .lowest_build_id
                .store(self.build_id, Ordering::Relaxed);

            let mut info = StepInfo::new(step);
            info.lowest_share_used = self.share_used;
            info
        }
    }

    #[test]
    fn test_global_priority_dominates() {
        let hot = TestStep {
            global: 10,
            share_used: 100.0,
            ..TestStep::default()
        }
        .build();
        let cold = TestStep {
            global: 5,
            share_used: 0.0,
            ..TestStep::default()
        }
        .build();

        assert_eq!(hot.compare(&cold), std::cmp::Ordering::Less);
        assert_eq!(cold.compare(&hot), std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_fairness_least_used_jobset_wins() {
        // two jobsets with equal shares and priorities: the one with less
        // recent CPU time goes first
        let idle = TestStep {
            share_used: 0.0,
            build_id: 2,
            ..TestStep::default()
        }
        .build();
        let busy = TestStep {
            share_used: 36_000.0,
            build_id: 1,
            ..TestStep::default()
        }
        .build();

        assert_eq!(idle.compare(&busy), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_local_priority_breaks_share_tie() {
        let urgent = TestStep {
            local: 100,
            build_id: 2,
            ..TestStep::default()
        }
        .build();
        let normal = TestStep {
            local: 0,
            build_id: 1,
            ..TestStep::default()
        }
        .build();

        assert_eq!(urgent.compare(&normal), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_fifo_by_build_id() {
        let older = TestStep {
            build_id: 10,
            ..TestStep::default()
        }
        .build();
        let newer = TestStep {
            build_id: 20,
            ..TestStep::default()
        }
        .build();

        assert_eq!(older.compare(&newer), std::cmp::Ordering::Less);
        assert_eq!(newer.compare(&older), std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_runnable_since_is_final_tiebreak() {
        let s1 = TestStep::default().build();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let s2 = TestStep::default().build();
        s1.step.atomic_state.set_created(true);
        s2.step.atomic_state.set_created(true);
        s1.step.mark_runnable();
        s2.step.mark_runnable();

        let s1 = StepInfo::new(s1.step.clone());
        let s2 = StepInfo::new(s2.step.clone());
        assert_eq!(s1.compare(&s2), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_sort_uses_snapshot_of_share_used() {
        // share usage taken at snapshot time, live jobset changes do not
        // reorder an in-flight pass
        let step = Step::new(store::StorePath::new(
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-test.recipe",
        ));
        let jobset = Arc::new(Jobset::new(1, "proj", "main"));
        step.add_jobset(jobset.clone());
        let info = StepInfo::new(step);

        jobset.add_step(jiff::Timestamp::now().as_second(), 10_000);
        let other = TestStep {
            share_used: 5_000.0,
            ..TestStep::default()
        }
        .build();

        // info froze share_used at 0, so it still wins
        assert_eq!(info.compare(&other), std::cmp::Ordering::Less);
    }
}
