use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashSet;

use db::models::BuildID;

use super::{Build, Jobset};

#[derive(Debug)]
pub struct StepAtomicState {
    created: AtomicBool,  // Whether the step has finished initialisation.
    pub tries: AtomicU32, // Number of times we've tried this step.
    pub highest_global_priority: AtomicI32, // The highest global priority of any build depending on this step.
    pub highest_local_priority: AtomicI32, // The highest local priority of any build depending on this step.

    pub lowest_build_id: AtomicI32, // The lowest ID of any build depending on this step.

    pub after: super::AtomicDateTime, // Point in time after which the step can be retried.
    pub runnable_since: super::AtomicDateTime, // The time at which this step became runnable.

    pub deps_len: AtomicU64,
}

impl StepAtomicState {
    pub fn new() -> Self {
        Self {
            created: false.into(),
            tries: 0.into(),
            highest_global_priority: 0.into(),
            highest_local_priority: 0.into(),
            lowest_build_id: BuildID::MAX.into(),
            after: super::AtomicDateTime::new(jiff::Timestamp::UNIX_EPOCH),
            runnable_since: super::AtomicDateTime::new(jiff::Timestamp::UNIX_EPOCH),
            deps_len: 0.into(),
        }
    }

    #[inline]
    pub fn get_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_created(&self, v: bool) {
        self.created.store(v, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct StepState {
    deps: HashSet<Arc<Step>>,      // The build steps on which this step depends.
    rdeps: Vec<Weak<Step>>,        // The build steps that depend on this step.
    builds: Vec<Weak<Build>>,      // Builds that have this step as the top-level recipe.
    jobsets: HashSet<Arc<Jobset>>, // Jobsets to which this step belongs.
}

#[derive(Debug)]
pub struct Step {
    recipe_path: store::StorePath,
    recipe: arc_swap::ArcSwapOption<store::Recipe>,

    runnable: AtomicBool,
    finished: AtomicBool,
    previous_failure: AtomicBool,
    pub atomic_state: StepAtomicState,
    state: parking_lot::RwLock<StepState>,
}

impl PartialEq for Step {
    fn eq(&self, other: &Self) -> bool {
        self.recipe_path == other.recipe_path
    }
}

impl Eq for Step {}

impl std::hash::Hash for Step {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // recipe_path is immutable, so Step can live in hash sets
        self.recipe_path.hash(state);
    }
}

impl Step {
    #[must_use]
    pub fn new(recipe_path: store::StorePath) -> Arc<Self> {
        Arc::new(Self {
            recipe_path,
            recipe: arc_swap::ArcSwapOption::from(None),
            runnable: false.into(),
            finished: false.into(),
            previous_failure: false.into(),
            atomic_state: StepAtomicState::new(),
            state: parking_lot::RwLock::new(StepState::default()),
        })
    }

    #[inline]
    pub const fn get_recipe_path(&self) -> &store::StorePath {
        &self.recipe_path
    }

    #[inline]
    pub fn get_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_finished(&self, v: bool) {
        self.finished.store(v, Ordering::SeqCst);
    }

    #[inline]
    pub fn get_previous_failure(&self) -> bool {
        self.previous_failure.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_previous_failure(&self, v: bool) {
        self.previous_failure.store(v, Ordering::SeqCst);
    }

    #[inline]
    pub fn get_runnable(&self) -> bool {
        self.runnable.load(Ordering::SeqCst)
    }

    pub fn set_recipe(&self, recipe: store::Recipe) {
        self.recipe.store(Some(Arc::new(recipe)));
    }

    pub fn get_platform(&self) -> Option<String> {
        let recipe = self.recipe.load_full();
        recipe.as_ref().map(|r| r.platform.clone())
    }

    pub fn get_system_type(&self) -> Option<String> {
        let recipe = self.recipe.load_full();
        recipe.as_ref().map(|r| r.system_type())
    }

    pub fn get_required_features(&self) -> Vec<String> {
        let recipe = self.recipe.load_full();
        recipe
            .as_ref()
            .map(|r| r.required_features.to_vec())
            .unwrap_or_default()
    }

    pub fn get_prefer_local(&self) -> bool {
        let recipe = self.recipe.load_full();
        recipe.as_ref().is_some_and(|r| r.prefer_local)
    }

    pub fn get_input_recipes(&self) -> Vec<store::StorePath> {
        let recipe = self.recipe.load_full();
        recipe
            .as_ref()
            .map(|r| r.inputs.to_vec())
            .unwrap_or_default()
    }

    pub fn get_outputs(&self) -> Vec<store::RecipeOutput> {
        let recipe = self.recipe.load_full();
        recipe
            .as_ref()
            .map(|r| r.outputs.to_vec())
            .unwrap_or_default()
    }

    pub fn get_after(&self) -> jiff::Timestamp {
        self.atomic_state.after.load()
    }

    pub fn set_after(&self, v: jiff::Timestamp) {
        self.atomic_state.after.store(v);
    }

    pub fn get_runnable_since(&self) -> jiff::Timestamp {
        self.atomic_state.runnable_since.load()
    }

    pub fn get_deps_size(&self) -> u64 {
        self.atomic_state.deps_len.load(Ordering::Relaxed)
    }

    /// Transitive closure of builds and steps that depend on this step,
    /// following the weak back-references with a worklist (no recursion, so
    /// deep graphs cannot blow the stack).
    #[tracing::instrument(skip(self, builds, steps))]
    pub fn get_dependents(
        self: &Arc<Self>,
        builds: &mut HashSet<Arc<Build>>,
        steps: &mut HashSet<Arc<Self>>,
    ) {
        let mut pending = vec![self.clone()];
        while let Some(step) = pending.pop() {
            if !steps.insert(step.clone()) {
                continue;
            }

            let state = step.state.read();
            builds.extend(
                state
                    .builds
                    .iter()
                    .filter_map(Weak::upgrade)
                    .filter(|b| !b.get_finished_in_db()),
            );
            pending.extend(state.rdeps.iter().filter_map(Weak::upgrade));
        }
    }

    /// Remove this (finished) step from its dependents' dependency sets.
    /// Returns the dependents that became runnable, for insertion into the
    /// runnable set by the caller. Never holds two step locks at once.
    pub fn unlink_from_rdeps(&self) -> Vec<Arc<Self>> {
        if !self.get_finished() {
            return Vec::new();
        }

        let dependents: Vec<Arc<Self>> = {
            let mut state = self.state.write();
            state.rdeps.retain(|w| w.strong_count() > 0);
            state.rdeps.iter().filter_map(Weak::upgrade).collect()
        };

        let mut promoted = Vec::new();
        for rdep in dependents {
            let unblocked = {
                let mut rdep_state = rdep.state.write();
                rdep_state
                    .deps
                    .retain(|d| d.get_recipe_path() != self.get_recipe_path());
                rdep.atomic_state
                    .deps_len
                    .store(rdep_state.deps.len() as u64, Ordering::Relaxed);
                rdep_state.deps.is_empty()
            };
            if unblocked && rdep.atomic_state.get_created() {
                promoted.push(rdep);
            }
        }
        promoted
    }

    /// Mark the step runnable; only the first call records `runnable_since`.
    #[tracing::instrument(skip(self))]
    pub fn mark_runnable(&self) {
        debug_assert!(self.atomic_state.get_created());
        debug_assert!(!self.get_finished());

        #[cfg(debug_assertions)]
        {
            let state = self.state.read();
            debug_assert!(state.deps.is_empty());
        }

        if !self.runnable.swap(true, Ordering::SeqCst) {
            tracing::info!("step '{}' is now runnable", self.get_recipe_path());
            self.atomic_state.runnable_since.store(jiff::Timestamp::now());
        }
    }

    pub fn get_lowest_share_used(&self) -> f64 {
        let state = self.state.read();

        state
            .jobsets
            .iter()
            .map(|v| v.share_used())
            .min_by(f64::total_cmp)
            .unwrap_or(1e9)
    }

    pub fn get_jobsets(&self) -> Vec<Arc<Jobset>> {
        let state = self.state.read();
        state.jobsets.iter().cloned().collect()
    }

    pub fn add_jobset(&self, jobset: Arc<Jobset>) {
        let mut state = self.state.write();
        state.jobsets.insert(jobset);
    }

    pub fn add_dep(&self, dep: Arc<Self>) {
        let mut state = self.state.write();
        state.deps.insert(dep);
        self.atomic_state
            .deps_len
            .store(state.deps.len() as u64, Ordering::Relaxed);
    }

    /// Register a build whose top-level recipe this step is.
    pub fn link_build(&self, build: &Arc<Build>) {
        self.state.write().builds.push(Arc::downgrade(build));
    }

    /// Register a step that depends on this one.
    pub fn link_rdep(&self, rdep: &Arc<Self>) {
        self.state.write().rdeps.push(Arc::downgrade(rdep));
    }

    /// Builds that have this step as their top-level recipe and are not yet
    /// finalized.
    pub fn get_direct_builds(&self) -> Vec<Arc<Build>> {
        self.state
            .read()
            .builds
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|b| !b.get_finished_in_db())
            .collect()
    }

    pub fn direct_deps(&self) -> Vec<Arc<Self>> {
        self.state.read().deps.iter().cloned().collect()
    }

    /// Fold one build's scheduling attributes into this step's aggregates.
    /// Extrema only ever widen, so repeating this after a priority bump is
    /// safe.
    pub fn widen_aggregates(&self, build: &Build) {
        self.atomic_state.highest_global_priority.fetch_max(
            build.global_priority.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.atomic_state
            .highest_local_priority
            .fetch_max(build.local_priority, Ordering::Relaxed);
        self.atomic_state
            .lowest_build_id
            .fetch_min(build.id, Ordering::Relaxed);
    }
}

/// The global step map. Holds weak handles only: steps stay alive by being
/// reachable from a build or by an active reservation, and vanish from here
/// once the last owner drops them.
#[derive(Clone)]
pub struct Steps {
    inner: Arc<parking_lot::RwLock<hashbrown::HashMap<store::StorePath, Weak<Step>>>>,
}

impl Default for Steps {
    fn default() -> Self {
        Self::new()
    }
}

impl Steps {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(hashbrown::HashMap::with_capacity(
                10000,
            ))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let mut steps = self.inner.write();
        steps.retain(|_, s| s.upgrade().is_some());
        steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up or allocate the step for a recipe, linking the referring
    /// build/step. `is_new` tells the caller it must initialise the step.
    /// Entries whose step died are replaced transparently.
    #[must_use]
    pub fn create(
        &self,
        recipe_path: &store::StorePath,
        referring_build: Option<&Arc<Build>>,
        referring_step: Option<&Arc<Step>>,
    ) -> (Arc<Step>, bool) {
        let (step, is_new) = {
            let mut steps = self.inner.write();
            match steps.get(recipe_path).and_then(Weak::upgrade) {
                Some(step) => (step, false),
                None => {
                    let step = Step::new(recipe_path.to_owned());
                    steps.insert(recipe_path.to_owned(), Arc::downgrade(&step));
                    (step, true)
                }
            }
        };

        if let Some(build) = referring_build {
            step.link_build(build);
        }
        if let Some(rdep) = referring_step {
            step.link_rdep(rdep);
        }
        (step, is_new)
    }

    pub fn remove(&self, recipe_path: &store::StorePath) {
        let mut steps = self.inner.write();
        steps.remove(recipe_path);
    }

    /// Unlink every finished step from its dependents. Catches dependency
    /// edges added to a step while it was concurrently finishing.
    pub fn unlink_finished_steps(&self) -> Vec<Arc<Step>> {
        let mut newly_runnable = Vec::new();
        let steps = self.inner.read();
        for (_, s) in steps.iter() {
            let Some(s) = s.upgrade() else {
                continue;
            };
            if s.get_finished() && !s.get_previous_failure() {
                newly_runnable.extend(s.unlink_from_rdeps());
            }
        }
        newly_runnable
    }
}

/// Build steps with no unbuilt dependencies, in insertion order. Weak
/// references: steps whose builds were all cancelled are pruned on the next
/// snapshot instead of being chased down eagerly.
pub struct Runnable {
    inner: parking_lot::Mutex<Vec<Weak<Step>>>,
}

impl Default for Runnable {
    fn default() -> Self {
        Self::new()
    }
}

impl Runnable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(Vec::with_capacity(100)),
        }
    }

    pub fn push(&self, step: &Arc<Step>) {
        let mut inner = self.inner.lock();
        if inner
            .iter()
            .filter_map(Weak::upgrade)
            .any(|s| s.get_recipe_path() == step.get_recipe_path())
        {
            return;
        }
        inner.push(Arc::downgrade(step));
    }

    /// Current candidates in insertion order; dead entries are dropped.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Step>> {
        let mut inner = self.inner.lock();
        let mut alive = Vec::with_capacity(inner.len());
        inner.retain(|w| {
            let Some(step) = w.upgrade() else {
                return false;
            };
            alive.push(step);
            true
        });
        alive
    }

    /// Called when a step is reserved or finalized.
    pub fn remove(&self, recipe_path: &store::StorePath) {
        let mut inner = self.inner.lock();
        inner.retain(|w| {
            w.upgrade()
                .is_some_and(|s| s.get_recipe_path() != recipe_path)
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.retain(|w| w.upgrade().is_some());
        inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(path: &str) -> store::StorePath {
        store::StorePath::new(path)
    }

    fn created_step(path: &str) -> Arc<Step> {
        let step = Step::new(recipe(path));
        step.atomic_state.set_created(true);
        step
    }

    #[test]
    fn test_steps_create_deduplicates_by_recipe() {
        let steps = Steps::new();
        let path = recipe("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-shared.recipe");

        let (s1, new1) = steps.create(&path, None, None);
        let (s2, new2) = steps.create(&path, None, None);

        assert!(new1);
        assert!(!new2);
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn test_steps_map_drops_dead_entries() {
        let steps = Steps::new();
        let path = recipe("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-gone.recipe");
        {
            let (_step, is_new) = steps.create(&path, None, None);
            assert!(is_new);
        }
        // the only strong reference is gone, so the map entry is stale
        assert_eq!(steps.len(), 0);

        let (_step, is_new) = steps.create(&path, None, None);
        assert!(is_new);
    }

    #[test]
    fn test_unlink_from_rdeps_promotes_dependents() {
        let dep = created_step("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-dep.recipe");
        let parent = created_step("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-parent.recipe");

        parent.add_dep(dep.clone());
        dep.link_rdep(&parent);
        assert_eq!(parent.get_deps_size(), 1);

        // not finished yet: no promotion
        assert!(dep.unlink_from_rdeps().is_empty());

        dep.set_finished(true);
        let newly = dep.unlink_from_rdeps();
        assert_eq!(newly.len(), 1);
        assert!(Arc::ptr_eq(&newly[0], &parent));
        assert_eq!(parent.get_deps_size(), 0);

        // repeating the unlink is a no-op: the dep set is already empty and
        // the dependent is reported again only because it is still runnable
        let again = dep.unlink_from_rdeps();
        assert_eq!(again.len(), 1);
        assert_eq!(parent.get_deps_size(), 0);
    }

    #[test]
    fn test_runnable_dedup_and_order() {
        let runnable = Runnable::new();
        let s1 = created_step("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-one.recipe");
        let s2 = created_step("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-two.recipe");

        runnable.push(&s1);
        runnable.push(&s2);
        runnable.push(&s1);

        let snap = runnable.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(Arc::ptr_eq(&snap[0], &s1));
        assert!(Arc::ptr_eq(&snap[1], &s2));
    }

    #[test]
    fn test_runnable_prunes_dead_weaks() {
        let runnable = Runnable::new();
        let s1 = created_step("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-one.recipe");
        {
            let s2 = created_step("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-two.recipe");
            runnable.push(&s1);
            runnable.push(&s2);
        }

        let snap = runnable.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(Arc::ptr_eq(&snap[0], &s1));
    }

    #[test]
    fn test_runnable_remove() {
        let runnable = Runnable::new();
        let s1 = created_step("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-one.recipe");
        runnable.push(&s1);
        runnable.remove(s1.get_recipe_path());
        assert!(runnable.is_empty());
    }

    #[test]
    fn test_mark_runnable_records_first_time_only() {
        let step = created_step("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-one.recipe");
        step.mark_runnable();
        let since = step.get_runnable_since();
        std::thread::sleep(std::time::Duration::from_millis(5));
        step.mark_runnable();
        assert_eq!(step.get_runnable_since(), since);
    }
}
