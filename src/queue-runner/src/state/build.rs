use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use hashbrown::{HashMap, HashSet};

use db::models::{BuildID, BuildStatus};

use super::{Jobset, JobsetID, Step};
use crate::remote::RemoteStatus;

#[derive(Debug)]
pub struct Build {
    pub id: BuildID,
    pub recipe_path: store::StorePath,
    pub jobset_id: JobsetID,
    pub name: String,
    pub timestamp: jiff::Timestamp,
    pub max_silent_time: i32,
    pub timeout: i32,
    pub local_priority: i32,
    pub global_priority: AtomicI32,

    toplevel: arc_swap::ArcSwapOption<Step>,
    pub jobset: Arc<Jobset>,

    finished_in_db: AtomicBool,
}

impl PartialEq for Build {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Build {}

impl std::hash::Hash for Build {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Build {
    #[tracing::instrument(skip(v, jobset), err)]
    pub fn new(v: db::models::Build, jobset: Arc<Jobset>) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            id: v.id,
            recipe_path: store::StorePath::new(&v.recipe_path),
            jobset_id: v.jobset_id,
            name: v.job,
            timestamp: jiff::Timestamp::from_second(v.timestamp)?,
            max_silent_time: v.max_silent.unwrap_or(3600),
            timeout: v.timeout.unwrap_or(36000),
            local_priority: v.priority,
            global_priority: v.global_priority.into(),
            toplevel: arc_swap::ArcSwapOption::from(None),
            jobset,
            finished_in_db: false.into(),
        }))
    }

    #[inline]
    pub fn full_job_name(&self) -> String {
        format!(
            "{}:{}:{}",
            self.jobset.project_name, self.jobset.name, self.name
        )
    }

    #[inline]
    pub fn get_finished_in_db(&self) -> bool {
        self.finished_in_db.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_finished_in_db(&self, v: bool) {
        self.finished_in_db.store(v, Ordering::SeqCst);
    }

    #[inline]
    pub fn set_toplevel_step(&self, step: Arc<Step>) {
        self.toplevel.store(Some(step));
    }

    /// Push this build's priority extrema and jobset into every step of its
    /// closure (the step dedupes by widening, see `Step::widen_aggregates`).
    pub fn propagate_priorities(&self) {
        let Some(toplevel) = self.toplevel.load_full() else {
            return;
        };

        let mut seen = HashSet::new();
        let mut stack = vec![toplevel];
        while let Some(step) = stack.pop() {
            if !seen.insert(step.get_recipe_path().clone()) {
                continue;
            }

            step.widen_aggregates(self);
            step.add_jobset(self.jobset.clone());
            stack.extend(step.direct_deps());
        }
    }
}

/// The scheduler-side record of one attempt at a step, accumulated by the
/// builder worker and written to the build step row when the attempt ends.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_status: BuildStatus,
    pub can_retry: bool,
    pub can_cache: bool,
    pub is_cached: bool,
    pub error_msg: Option<String>,

    start_time: Option<jiff::Timestamp>,
    stop_time: Option<jiff::Timestamp>,

    pub log_file: String,
}

impl Default for StepResult {
    fn default() -> Self {
        Self::new()
    }
}

impl StepResult {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            step_status: BuildStatus::Aborted,
            can_retry: false,
            can_cache: false,
            is_cached: false,
            error_msg: None,
            start_time: None,
            stop_time: None,
            log_file: String::new(),
        }
    }

    /// Classify a remote protocol status (§ the remote build contract) into
    /// the step status plus retry/cache flags.
    pub const fn update_with_remote_status(&mut self, status: RemoteStatus) {
        match status {
            RemoteStatus::Success => {
                self.step_status = BuildStatus::Success;
            }
            RemoteStatus::TransientFailure | RemoteStatus::MiscFailure => {
                self.step_status = BuildStatus::Failed;
                self.can_retry = true;
            }
            RemoteStatus::PermanentFailure => {
                self.step_status = BuildStatus::Failed;
                self.can_cache = true;
            }
            RemoteStatus::BuildFailureWithOutput => {
                self.step_status = BuildStatus::FailedWithOutput;
                self.can_cache = true;
            }
            RemoteStatus::TimedOut => {
                self.step_status = BuildStatus::TimedOut;
            }
            RemoteStatus::LogLimitExceeded => {
                self.step_status = BuildStatus::LogLimitExceeded;
            }
        }
    }

    #[must_use]
    pub fn get_total_step_time_ms(&self) -> u64 {
        if let (Some(start_time), Some(stop_time)) = (self.start_time, self.stop_time) {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            ((stop_time - start_time)
                .total(jiff::Unit::Millisecond)
                .unwrap_or_default()
                .abs() as u64)
        } else {
            0
        }
    }

    pub const fn set_start_and_stop(&mut self, v: jiff::Timestamp) {
        self.start_time = Some(v);
        self.stop_time = Some(v);
    }

    pub fn set_start_time_now(&mut self) {
        self.start_time = Some(jiff::Timestamp::now());
    }

    pub fn set_stop_time_now(&mut self) {
        self.stop_time = Some(jiff::Timestamp::now());
    }

    #[must_use]
    pub const fn has_start_time(&self) -> bool {
        self.start_time.is_some()
    }

    #[must_use]
    pub const fn has_stop_time(&self) -> bool {
        self.stop_time.is_some()
    }

    pub fn get_start_time_as_i32(&self) -> Result<i32, std::num::TryFromIntError> {
        i32::try_from(
            self.start_time
                .map(jiff::Timestamp::as_second)
                .unwrap_or_default(),
        )
    }

    pub fn get_stop_time_as_i32(&self) -> Result<i32, std::num::TryFromIntError> {
        i32::try_from(
            self.stop_time
                .map(jiff::Timestamp::as_second)
                .unwrap_or_default(),
        )
    }
}

/// Realized outputs of a finished step, read back from the store.
pub struct BuildOutput {
    pub outputs: HashMap<String, store::StorePath>,
    pub size: u64,
}

impl BuildOutput {
    pub async fn new(local_store: &store::LocalStore, outputs: Vec<store::RecipeOutput>) -> Self {
        let mut outputs_map = HashMap::with_capacity(outputs.len());
        let mut size = 0;

        for o in outputs {
            if let Some(path) = o.path {
                size += local_store.output_size(&path).await;
                outputs_map.insert(o.name, path);
            }
        }

        Self {
            outputs: outputs_map,
            size,
        }
    }

    pub fn as_db_outputs(&self, local_store: &store::LocalStore) -> Vec<(String, String)> {
        self.outputs
            .iter()
            .map(|(name, path)| (name.clone(), local_store.print_store_path(path)))
            .collect()
    }
}

#[derive(Clone)]
pub struct Builds {
    inner: Arc<parking_lot::RwLock<HashMap<BuildID, Arc<Build>>>>,
}

impl Default for Builds {
    fn default() -> Self {
        Self::new()
    }
}

impl Builds {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(HashMap::with_capacity(1000))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: BuildID) -> bool {
        self.inner.read().contains_key(&id)
    }

    /// Reconcile against the set of builds still queued in the database:
    /// drop cancelled/deleted builds (releasing their step references) and
    /// re-propagate bumped global priorities.
    pub fn update_priorities(&self, curr_ids: &HashMap<BuildID, i32>) {
        let mut builds = self.inner.write();
        builds.retain(|k, _| curr_ids.contains_key(k));
        for (id, build) in builds.iter() {
            let Some(new_priority) = curr_ids.get(id) else {
                continue;
            };

            if build.global_priority.load(Ordering::Relaxed) < *new_priority {
                tracing::info!("priority of build {id} increased");
                build
                    .global_priority
                    .store(*new_priority, Ordering::Relaxed);
                build.propagate_priorities();
            }
        }
    }

    pub fn insert_new_build(&self, build: Arc<Build>) {
        let mut builds = self.inner.write();
        builds.insert(build.id, build);
    }

    pub fn remove_by_id(&self, id: BuildID) {
        let mut builds = self.inner.write();
        builds.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_build(id: BuildID, local_priority: i32, global_priority: i32) -> Arc<Build> {
        Arc::new(Build {
            id,
            recipe_path: store::StorePath::new("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-top.recipe"),
            jobset_id: 1,
            name: "job".into(),
            timestamp: jiff::Timestamp::now(),
            max_silent_time: 3600,
            timeout: 36000,
            local_priority,
            global_priority: global_priority.into(),
            toplevel: arc_swap::ArcSwapOption::from(None),
            jobset: Arc::new(Jobset::new(1, "proj", "main")),
            finished_in_db: false.into(),
        })
    }

    #[test]
    fn test_propagate_priorities_widen_only() {
        let step = Step::new(store::StorePath::new(
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-top.recipe",
        ));
        let dep = Step::new(store::StorePath::new(
            "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-dep.recipe",
        ));
        step.add_dep(dep.clone());

        let b1 = test_build(7, 10, 100);
        b1.set_toplevel_step(step.clone());
        b1.propagate_priorities();

        let b2 = test_build(3, 5, 50);
        b2.set_toplevel_step(step.clone());
        b2.propagate_priorities();

        for s in [&step, &dep] {
            assert_eq!(
                s.atomic_state
                    .highest_global_priority
                    .load(Ordering::Relaxed),
                100
            );
            assert_eq!(
                s.atomic_state
                    .highest_local_priority
                    .load(Ordering::Relaxed),
                10
            );
            assert_eq!(s.atomic_state.lowest_build_id.load(Ordering::Relaxed), 3);
        }
    }

    #[test]
    fn test_update_priorities_drops_cancelled() {
        let builds = Builds::new();
        builds.insert_new_build(test_build(1, 0, 0));
        builds.insert_new_build(test_build(2, 0, 0));

        let mut curr = HashMap::new();
        curr.insert(2, 0);
        builds.update_priorities(&curr);

        assert!(!builds.contains(1));
        assert!(builds.contains(2));
    }

    #[test]
    fn test_remote_status_classification() {
        let mut r = StepResult::new();
        r.update_with_remote_status(RemoteStatus::TransientFailure);
        assert_eq!(r.step_status, BuildStatus::Failed);
        assert!(r.can_retry);
        assert!(!r.can_cache);

        let mut r = StepResult::new();
        r.update_with_remote_status(RemoteStatus::PermanentFailure);
        assert!(!r.can_retry);
        assert!(r.can_cache);

        let mut r = StepResult::new();
        r.update_with_remote_status(RemoteStatus::BuildFailureWithOutput);
        assert_eq!(r.step_status, BuildStatus::FailedWithOutput);
        assert!(r.can_cache);

        let mut r = StepResult::new();
        r.update_with_remote_status(RemoteStatus::TimedOut);
        assert_eq!(r.step_status, BuildStatus::TimedOut);
        assert!(!r.can_retry);
    }
}
