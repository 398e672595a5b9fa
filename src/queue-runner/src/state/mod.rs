mod atomic;
mod build;
mod jobset;
mod log_compressor;
mod machine;
mod metrics;
mod notifications;
mod step;
mod step_info;

pub use atomic::AtomicDateTime;
pub use build::{Build, BuildOutput, Builds, StepResult};
pub use jobset::{Jobset, JobsetID, Jobsets, SCHEDULING_WINDOW};
pub use log_compressor::LogCompressor;
pub use machine::{Machine, MachineReservation, Machines, Stats as MachineStats};
pub use metrics::Metrics;
pub use notifications::NotificationSender;
pub use step::{Runnable, Step, Steps};
pub use step_info::StepInfo;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

use futures::TryStreamExt as _;
use hashbrown::{HashMap, HashSet};
use secrecy::ExposeSecret as _;

use db::models::{BuildID, BuildStatus, CreateBuildStep, MarkBuildSucceeded};

use crate::config::{App, Cli};
use crate::remote::{self, RemoteStatus};
use crate::utils::finish_build_step;

enum CreateStepResult {
    /// Every output is already realized, no step needed.
    None,
    Valid(Arc<Step>),
    /// An output of this step carries a failure marker.
    PreviousFailure(Arc<Step>),
    /// The recipe is missing or unparseable.
    Corrupt(String),
}

pub struct State {
    pub store: store::LocalStore,
    pub config: App,
    pub cli: Cli,
    pub db: db::Database,

    pub machines: Machines,

    pub log_dir: std::path::PathBuf,

    pub builds: Builds,
    pub jobsets: Jobsets,
    pub steps: Steps,
    pub runnable: Runnable,

    // queue watermark; a builds_restarted notification forces a full rescan
    last_seen_build_id: AtomicI32,
    rescan: AtomicBool,

    pub started_at: jiff::Timestamp,

    pub metrics: Metrics,
    notify_dispatch: Arc<tokio::sync::Notify>,
    pub notifications: NotificationSender,
    pub log_compressor: LogCompressor,
}

impl State {
    #[tracing::instrument(err)]
    pub async fn new() -> anyhow::Result<Arc<Self>> {
        let cli = Cli::new();
        let config = App::init(&cli.config_path)?;
        let log_dir = config.get_log_dir();
        let db = db::Database::new(
            config.get_db_url().expose_secret(),
            config.get_max_db_connections(),
        )
        .await?;

        let _ = fs_err::tokio::create_dir_all(&log_dir).await;

        Ok(Arc::new(Self {
            store: store::LocalStore::open(config.get_store_dir()),
            cli,
            db,
            machines: Machines::new(),
            log_dir,
            builds: Builds::new(),
            jobsets: Jobsets::new(),
            steps: Steps::new(),
            runnable: Runnable::new(),
            last_seen_build_id: 0.into(),
            rescan: false.into(),
            started_at: jiff::Timestamp::now(),
            metrics: Metrics::new()?,
            notify_dispatch: Arc::new(tokio::sync::Notify::new()),
            notifications: NotificationSender::new(),
            log_compressor: LogCompressor::new(),
            config,
        }))
    }

    #[tracing::instrument(skip(self, new_config), err)]
    pub async fn reload_config_callback(
        &self,
        new_config: &crate::config::PreparedApp,
    ) -> anyhow::Result<()> {
        let curr_db_url = self.config.get_db_url();
        if curr_db_url.expose_secret() != new_config.db_url.expose_secret() {
            self.db
                .reconfigure_pool(new_config.db_url.expose_secret())?;
        }
        // a changed machines file path is picked up by the next inventory pass
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn clear_busy(&self) -> anyhow::Result<()> {
        let mut conn = self.db.get().await?;
        #[allow(clippy::cast_possible_truncation)]
        conn.clear_busy(jiff::Timestamp::now().as_second() as i32)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn trigger_dispatch(&self) {
        self.notify_dispatch.notify_one();
    }

    fn make_runnable(&self, step: &Arc<Step>) {
        step.mark_runnable();
        self.runnable.push(step);
    }

    async fn construct_log_file_path(
        &self,
        recipe_path: &store::StorePath,
    ) -> anyhow::Result<std::path::PathBuf> {
        let mut log_file = self.log_dir.clone();
        let (dir, file) = recipe_path.base_name().split_at(2);
        log_file.push(dir);
        let _ = fs_err::tokio::create_dir_all(&log_file).await;
        log_file.push(file);
        Ok(log_file)
    }

    fn printed_outputs(&self, step: &Arc<Step>) -> Vec<(String, Option<String>)> {
        step.get_outputs()
            .into_iter()
            .map(|o| (o.name, o.path.map(|p| self.store.print_store_path(&p))))
            .collect()
    }

    // ------------------------------------------------------------------
    // Queue monitor
    // ------------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub fn start_queue_monitor_loop(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn({
            async move {
                if let Err(e) = Box::pin(self.queue_monitor_loop()).await {
                    tracing::error!("Failed to run queue monitor loop. e={e}");
                }
            }
        });
        task.abort_handle()
    }

    #[tracing::instrument(skip(self), err)]
    async fn queue_monitor_loop(&self) -> anyhow::Result<()> {
        let mut listener = self
            .db
            .listener(vec![
                "builds_added",
                "builds_restarted",
                "builds_cancelled",
                "builds_deleted",
                "builds_bumped",
                "jobset_shares_changed",
            ])
            .await?;

        loop {
            if let Err(e) = self.get_queued_builds().await {
                // the monitor cannot make progress without the database;
                // the next cycle retries
                tracing::error!("get_queued_builds failed inside queue monitor loop: {e}");
            }

            let queue_trigger_timer = self.config.get_queue_trigger_timer();
            let notification = if let Some(timer) = queue_trigger_timer {
                tokio::select! {
                    () = tokio::time::sleep(timer) => "timer_reached".to_owned(),
                    v = listener.try_next() => match v {
                        Ok(Some(v)) => v.channel().to_owned(),
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!("queue listener failed with e={e}");
                            continue;
                        }
                    },
                }
            } else {
                match listener.try_next().await {
                    Ok(Some(v)) => v.channel().to_owned(),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("queue listener failed with e={e}");
                        continue;
                    }
                }
            };
            self.metrics.nr_queue_wakeups.inc();
            tracing::trace!("queue monitor woken by {notification:?}");

            match notification.as_ref() {
                "builds_added" => {
                    tracing::debug!("got notification: new builds added to the queue");
                }
                "builds_restarted" => {
                    tracing::info!("got notification: builds restarted");
                    self.rescan.store(true, Ordering::SeqCst);
                }
                "builds_cancelled" | "builds_deleted" | "builds_bumped" => {
                    tracing::info!("got notification: builds cancelled, deleted or bumped");
                    if let Err(e) = self.process_queue_change().await {
                        tracing::error!("Failed to process queue change. e={e}");
                    }
                }
                "jobset_shares_changed" => {
                    tracing::info!("got notification: jobset shares changed");
                    match self.db.get().await {
                        Ok(mut conn) => {
                            if let Err(e) = self.jobsets.handle_change(&mut conn).await {
                                tracing::error!("Failed to handle jobset change. e={e}");
                            }
                        }
                        Err(e) => {
                            tracing::error!("Failed to get db connection for jobset change. e={e}");
                        }
                    }
                }
                _ => (),
            }
        }
    }

    #[tracing::instrument(skip(self), err)]
    async fn get_queued_builds(&self) -> anyhow::Result<()> {
        self.metrics.queue_checks_started.inc();

        let since = if self.rescan.swap(false, Ordering::SeqCst) {
            0
        } else {
            self.last_seen_build_id.load(Ordering::SeqCst)
        };

        let mut new_builds = Vec::new();
        {
            let mut conn = self.db.get().await?;
            for b in conn.get_queued_builds(since).await? {
                self.last_seen_build_id.fetch_max(b.id, Ordering::SeqCst);
                if self.builds.contains(b.id) {
                    continue;
                }
                let jobset = self
                    .jobsets
                    .create(&mut conn, b.jobset_id, &b.project, &b.jobset)
                    .await?;
                new_builds.push(Build::new(b, jobset)?);
            }
        }

        self.process_new_builds(new_builds).await;
        Ok(())
    }

    #[tracing::instrument(skip(self, new_builds))]
    async fn process_new_builds(&self, new_builds: Vec<Arc<Build>>) {
        let nr_added = new_builds.len();
        let now = Instant::now();

        let mut finished_recipes = HashSet::new();
        let mut new_runnable = Vec::new();
        for build in new_builds {
            Box::pin(self.create_build(build, &mut finished_recipes, &mut new_runnable)).await;
        }

        // catch dependency edges added to steps that finished concurrently
        let late_runnable = self.steps.unlink_finished_steps();

        let nr_runnable = new_runnable.len() + late_runnable.len();
        for r in new_runnable.into_iter().chain(late_runnable) {
            self.make_runnable(&r);
        }
        if nr_added > 0 {
            tracing::info!(
                "got {nr_runnable} new runnable steps from {nr_added} new builds in {:?}",
                now.elapsed()
            );
        }

        self.metrics.queue_checks_finished.inc();
        // a free machine may be waiting, dispatch is cheap
        self.trigger_dispatch();
    }

    #[tracing::instrument(skip(self, build, finished_recipes, new_runnable), fields(build_id = build.id))]
    async fn create_build(
        &self,
        build: Arc<Build>,
        finished_recipes: &mut HashSet<store::StorePath>,
        new_runnable: &mut Vec<Arc<Step>>,
    ) {
        self.metrics.queue_build_loads.inc();
        tracing::info!("loading build {} ({})", build.id, build.full_job_name());

        let mut new_steps = Vec::new();
        let res = Box::pin(self.create_step(
            build.clone(),
            build.recipe_path.clone(),
            Some(build.clone()),
            None,
            finished_recipes,
            &mut new_steps,
            new_runnable,
        ))
        .await;

        match res {
            CreateStepResult::Corrupt(msg) => {
                tracing::error!("aborting build {}: {msg}", build.id);
                if !build.get_finished_in_db() {
                    match self.db.get().await {
                        Ok(mut conn) => {
                            if let Err(e) = conn.abort_build(build.id, &msg).await {
                                tracing::error!("Failed to abort build={} e={}", build.id, e);
                            }
                        }
                        Err(e) => tracing::error!(
                            "Failed to get database connection to abort build={} e={}",
                            build.id,
                            e
                        ),
                    }
                }
                build.set_finished_in_db(true);
                self.metrics.nr_builds_done.inc();
            }
            CreateStepResult::PreviousFailure(step) => {
                if let Err(e) = self.handle_previous_failure(build, step).await {
                    tracing::error!("Failed to handle previous failure: {e}");
                }
            }
            CreateStepResult::Valid(step) => {
                if !build.get_finished_in_db() {
                    self.builds.insert_new_build(build.clone());
                }

                build.set_toplevel_step(step.clone());
                build.propagate_priorities();
                self.metrics.nr_builds_read.inc();

                tracing::info!(
                    "added build {} (top-level step {}, {} new steps)",
                    build.id,
                    step.get_recipe_path(),
                    new_steps.len()
                );
            }
            CreateStepResult::None => {
                // every output is already realized: a cache hit
                if let Err(e) = self.handle_cached_build(build).await {
                    tracing::error!("failed to handle cached build: {e}");
                }
            }
        }
    }

    /// Depth-first expansion of one recipe into a step, memoized across
    /// builds through the global steps map.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip_all, fields(build_id = build.id, %recipe_path))]
    async fn create_step(
        &self,
        build: Arc<Build>,
        recipe_path: store::StorePath,
        referring_build: Option<Arc<Build>>,
        referring_step: Option<Arc<Step>>,
        finished_recipes: &mut HashSet<store::StorePath>,
        new_steps: &mut Vec<Arc<Step>>,
        new_runnable: &mut Vec<Arc<Step>>,
    ) -> CreateStepResult {
        if finished_recipes.contains(&recipe_path) {
            return CreateStepResult::None;
        }

        let (step, is_new) = self.steps.create(
            &recipe_path,
            referring_build.as_ref(),
            referring_step.as_ref(),
        );
        if !is_new {
            return CreateStepResult::Valid(step);
        }
        self.metrics.queue_steps_created.inc();
        tracing::debug!("considering recipe '{recipe_path}'");

        let recipe = match self.store.query_recipe(&recipe_path).await {
            Ok(Some(recipe)) => recipe,
            Ok(None) => {
                return CreateStepResult::Corrupt(format!(
                    "recipe '{recipe_path}' is not in the store"
                ));
            }
            Err(e) => return CreateStepResult::Corrupt(e.to_string()),
        };
        let missing_outputs = self.store.missing_outputs(&recipe).await;
        step.set_recipe(recipe);

        if self.check_cached_failure(&step).await {
            step.set_previous_failure(true);
            return CreateStepResult::PreviousFailure(step);
        }

        if missing_outputs.is_empty() {
            finished_recipes.insert(recipe_path);
            step.set_finished(true);
            return CreateStepResult::None;
        }

        tracing::debug!("creating build step '{recipe_path}'");
        for input in step.get_input_recipes() {
            match Box::pin(self.create_step(
                build.clone(),
                input,
                None,
                Some(step.clone()),
                finished_recipes,
                new_steps,
                new_runnable,
            ))
            .await
            {
                CreateStepResult::None => (),
                CreateStepResult::Valid(dep) => {
                    // finished can be true when the step raced with a builder
                    // worker completing it
                    if !dep.get_finished() && !dep.get_previous_failure() {
                        step.add_dep(dep);
                    }
                }
                res @ (CreateStepResult::PreviousFailure(_) | CreateStepResult::Corrupt(_)) => {
                    return res;
                }
            }
        }

        step.atomic_state.set_created(true);
        if step.get_deps_size() == 0 {
            new_runnable.push(step.clone());
        }
        new_steps.push(step.clone());
        CreateStepResult::Valid(step)
    }

    #[tracing::instrument(skip(self, step), ret, level = "debug")]
    async fn check_cached_failure(&self, step: &Arc<Step>) -> bool {
        let paths = step
            .get_outputs()
            .into_iter()
            .filter_map(|o| o.path.map(|p| self.store.print_store_path(&p)))
            .collect::<Vec<_>>();
        if paths.is_empty() {
            return false;
        }

        let Ok(mut conn) = self.db.get().await else {
            return false;
        };

        conn.check_if_paths_failed(&paths).await.unwrap_or_default()
    }

    /// Some step of this build previously failed: finalize the build right
    /// away, citing the build whose step left the failure marker.
    #[tracing::instrument(skip(self, build, step), fields(build_id = build.id), err)]
    async fn handle_previous_failure(
        &self,
        build: Arc<Build>,
        step: Arc<Step>,
    ) -> anyhow::Result<()> {
        tracing::warn!(
            "marking build {} as cached failure due to '{}'",
            build.id,
            step.get_recipe_path()
        );
        if build.get_finished_in_db() {
            return Ok(());
        }

        let printed = self.store.print_store_path(step.get_recipe_path());
        let mut conn = self.db.get().await?;

        // find the build step that caused the failure, first by recipe, then
        // by output path
        let mut propagated_from = conn.get_last_failed_step_build(&printed).await?;
        if propagated_from.is_none() {
            for o in step.get_outputs() {
                let Some(path) = o.path else { continue };
                if let Ok(Some(res)) = conn
                    .get_last_failed_step_build_for_output(&self.store.print_store_path(&path))
                    .await
                {
                    propagated_from = Some(res);
                    break;
                }
            }
        }

        let mut tx = conn.begin_transaction().await?;
        tx.create_build_step(CreateBuildStep {
            start_time: None,
            build_id: build.id,
            recipe_path: &printed,
            platform: step.get_platform().as_deref(),
            machine: "",
            status: BuildStatus::CachedFailure,
            error_msg: None,
            propagated_from,
            outputs: self.printed_outputs(&step),
        })
        .await?;
        tx.update_build_after_previous_failure(
            build.id,
            if step.get_recipe_path() == &build.recipe_path {
                BuildStatus::Failed
            } else {
                BuildStatus::DepFailed
            },
        )
        .await?;
        tx.commit().await?;

        build.set_finished_in_db(true);
        self.notifications.enqueue(build.id, vec![]);
        self.metrics.nr_builds_done.inc();
        Ok(())
    }

    /// All outputs of the top-level recipe are already realized: record one
    /// substitution step per output and finalize the build as a cached
    /// success without ever creating a step.
    #[tracing::instrument(skip(self, build), fields(build_id = build.id), err)]
    async fn handle_cached_build(&self, build: Arc<Build>) -> anyhow::Result<()> {
        let recipe = self
            .store
            .query_recipe(&build.recipe_path)
            .await?
            .ok_or_else(|| anyhow::anyhow!("recipe vanished from the store"))?;
        let output = BuildOutput::new(&self.store, recipe.outputs.to_vec()).await;

        let now = i32::try_from(jiff::Timestamp::now().as_second())?;
        let printed = self.store.print_store_path(&build.recipe_path);
        {
            let mut conn = self.db.get().await?;
            let mut tx = conn.begin_transaction().await?;

            for o in &recipe.outputs {
                tx.create_substitution_step(
                    now,
                    now,
                    build.id,
                    &printed,
                    (
                        o.name.clone(),
                        o.path.as_ref().map(|p| self.store.print_store_path(p)),
                    ),
                )
                .await?;
            }

            tracing::info!("marking build {} as succeeded (cached)", build.id);
            tx.mark_succeeded_build(MarkBuildSucceeded {
                id: build.id,
                start_time: now,
                stop_time: now,
                size: i64::try_from(output.size)?,
                is_cached: true,
                outputs: output.as_db_outputs(&self.store),
            })
            .await?;
            tx.commit().await?;
        }
        build.set_finished_in_db(true);
        self.notifications.enqueue(build.id, vec![]);
        self.metrics.nr_substitutions.inc();
        self.metrics.nr_builds_done.inc();

        Ok(())
    }

    /// Reconcile the in-memory builds with the database after cancellation,
    /// deletion or priority bumps. Steps that lose all their builds are
    /// pruned lazily; a step already building is left to finish quietly.
    #[tracing::instrument(skip(self), err)]
    async fn process_queue_change(&self) -> anyhow::Result<()> {
        let mut conn = self.db.get().await?;
        let curr_ids: HashMap<_, _> = conn
            .get_not_finished_builds_fast()
            .await?
            .into_iter()
            .map(|b| (b.id, b.global_priority))
            .collect();
        self.builds.update_priorities(&curr_ids);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Machine inventory
    // ------------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub fn start_machines_monitor_loop(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn(async move {
            loop {
                let path = self.config.get_machines_file();
                match fs_err::tokio::read_to_string(&path).await {
                    Ok(contents) => {
                        let machines = Machines::parse_inventory(&contents);
                        if machines.is_empty() {
                            tracing::warn!("machine inventory {path:?} is empty");
                        }
                        self.machines.replace_all(machines);
                        self.metrics
                            .machines_total
                            .set(i64::try_from(self.machines.len()).unwrap_or_default());
                        self.trigger_dispatch();
                    }
                    Err(e) => tracing::error!("failed to read machine inventory {path:?}: {e}"),
                }
                tokio::time::sleep(self.config.get_machines_reload_interval()).await;
            }
        });
        task.abort_handle()
    }

    // ------------------------------------------------------------------
    // Dispatcher
    // ------------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub fn start_dispatch_loop(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn({
            async move {
                loop {
                    let next_retry = self.clone().do_dispatch_once().await;

                    let mut sleep_for = self.config.get_dispatch_trigger_timer();
                    if let Some(at) = next_retry {
                        let millis = at.as_millisecond() - jiff::Timestamp::now().as_millisecond();
                        let until =
                            std::time::Duration::from_millis(u64::try_from(millis.max(0)).unwrap_or_default());
                        sleep_for = Some(sleep_for.map_or(until, |t| t.min(until)));
                    }

                    if let Some(timer) = sleep_for {
                        tokio::select! {
                            () = self.notify_dispatch.notified() => {},
                            () = tokio::time::sleep(timer) => {},
                        };
                    } else {
                        self.notify_dispatch.notified().await;
                    }
                    self.metrics.nr_dispatcher_wakeups.inc();
                }
            }
        });
        task.abort_handle()
    }

    /// One dispatch pass. Returns the earliest retry-cooldown expiry among
    /// blocked candidates so the loop can wake itself for it.
    #[tracing::instrument(skip(self))]
    async fn do_dispatch_once(self: Arc<Self>) -> Option<jiff::Timestamp> {
        let before_work = Instant::now();
        tracing::debug!("starting dispatch");

        // Prune old historical build step info from the jobsets.
        self.jobsets.prune();

        let now = jiff::Timestamp::now();
        let mut earliest_retry: Option<jiff::Timestamp> = None;
        let mut candidates = Vec::new();

        for step in self.runnable.snapshot() {
            if step.get_finished() {
                self.runnable.remove(step.get_recipe_path());
                continue;
            }
            if !step.atomic_state.get_created() {
                continue;
            }
            // an empty inventory means we have not loaded the machines file
            // yet; steps are only unsupported relative to a real inventory
            if !self.machines.is_empty() && !self.machines.supports_step(&step) {
                self.runnable.remove(step.get_recipe_path());
                self.abort_unsupported_step(step).await;
                continue;
            }
            let after = step.get_after();
            if after > now {
                // still in retry cooldown
                earliest_retry = Some(earliest_retry.map_or(after, |e| e.min(after)));
                continue;
            }
            candidates.push(StepInfo::new(step));
        }

        candidates.sort_by(StepInfo::compare);

        let mut nr_waiting = 0_i64;
        for info in candidates {
            let Some(machine) = self.machines.find_best(&info.step, now) else {
                nr_waiting += 1;
                continue;
            };

            self.runnable.remove(info.step.get_recipe_path());
            let reservation = MachineReservation::new(
                machine,
                info.step.clone(),
                self.notify_dispatch.clone(),
            );
            tracing::info!(
                "dispatching step '{}' to machine '{}'",
                info.step.get_recipe_path(),
                reservation.machine.ssh_name
            );
            self.metrics.nr_steps_started.inc();
            self.metrics.nr_steps_building.inc();
            tokio::spawn(self.clone().builder(reservation));
        }

        self.metrics.nr_steps_waiting.set(nr_waiting);
        self.metrics
            .nr_steps_runnable
            .set(i64::try_from(self.runnable.len()).unwrap_or_default());
        self.metrics
            .machines_in_use
            .set(i64::try_from(self.machines.in_use()).unwrap_or_default());

        #[allow(clippy::cast_possible_truncation)]
        self.metrics
            .dispatch_time_ms
            .inc_by(before_work.elapsed().as_millis() as u64);

        earliest_retry
    }

    /// No configured machine can ever serve this step: finalize it (and its
    /// dependents) as unsupported within this dispatch pass.
    #[tracing::instrument(skip(self, step), fields(recipe = %step.get_recipe_path()))]
    async fn abort_unsupported_step(&self, step: Arc<Step>) {
        let system = step.get_system_type().unwrap_or_default();
        tracing::error!(
            "aborting unsupported build step '{}' (type '{system}')",
            step.get_recipe_path()
        );

        let mut dependents = HashSet::new();
        let mut steps = HashSet::new();
        step.get_dependents(&mut dependents, &mut steps);
        // Maybe the step got cancelled.
        let Some(build) = dependents
            .iter()
            .find(|b| b.recipe_path == *step.get_recipe_path())
            .or_else(|| dependents.iter().next())
            .cloned()
        else {
            return;
        };

        let mut result = StepResult::new();
        result.set_start_and_stop(jiff::Timestamp::now());
        result.step_status = BuildStatus::Unsupported;
        result.error_msg = Some(format!("unsupported system type '{system}'"));

        self.metrics.nr_steps_unsupported_aborted.inc();
        if let Err(e) = self.inner_fail_job(&step, None, result, build.id, 0).await {
            tracing::error!(
                "Failed to abort unsupported step '{}': {e}",
                step.get_recipe_path()
            );
        }
    }

    // ------------------------------------------------------------------
    // Builder worker
    // ------------------------------------------------------------------

    /// Runs once per reservation; the reservation is released on every exit
    /// path, which frees the machine slot and wakes the dispatcher.
    #[tracing::instrument(skip(self, reservation), fields(recipe = %reservation.step.get_recipe_path(), machine = %reservation.machine.ssh_name))]
    async fn builder(self: Arc<Self>, reservation: MachineReservation) {
        let step = reservation.step.clone();
        let machine = reservation.machine.clone();

        if let Err(e) = Box::pin(self.do_build_step(&step, &machine)).await {
            tracing::error!(
                "step '{}' failed inside the scheduler: {e}",
                step.get_recipe_path()
            );
            // scheduler-side failure (usually the database); retry later
            // without consuming a try
            let (_, retry_interval, _) = self.config.get_retry();
            step.set_after(jiff::Timestamp::now() + jiff::SignedDuration::from_secs(retry_delay_secs(retry_interval, 1.0, 1)));
            self.runnable.push(&step);
        }

        self.metrics.nr_steps_building.dec();
        self.metrics.nr_steps_done.inc();
        drop(reservation);
    }

    #[allow(clippy::too_many_lines)]
    #[tracing::instrument(skip(self, step, machine), err)]
    async fn do_build_step(&self, step: &Arc<Step>, machine: &Arc<Machine>) -> anyhow::Result<()> {
        let recipe_path = step.get_recipe_path().clone();

        // one attempt, one try
        let tries = step.atomic_state.tries.fetch_add(1, Ordering::Relaxed) + 1;

        let (build, options) = {
            let mut dependents = HashSet::new();
            let mut steps = HashSet::new();
            step.get_dependents(&mut dependents, &mut steps);

            if dependents.is_empty() {
                // Apparently all builds that depend on this step are gone
                // (e.g. cancelled). A new build may still pick the step up, so
                // requeue it; with no strong owners left the weak entry dies.
                tracing::info!("maybe cancelling build step {recipe_path}");
                step.atomic_state.tries.fetch_sub(1, Ordering::Relaxed);
                self.runnable.push(step);
                return Ok(());
            }

            let build = dependents
                .iter()
                .find(|b| b.recipe_path == recipe_path)
                .or_else(|| dependents.iter().next())
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("dependents vanished while picking a build"))?;

            // several builds can share this step; honor the largest timeouts
            // among them
            let mut options = store::BuildOptions::new();
            if let Some(max_silent) = dependents.iter().map(|b| b.max_silent_time).max() {
                options.set_max_silent_time(max_silent);
            }
            if let Some(timeout) = dependents.iter().map(|b| b.timeout).max() {
                options.set_build_timeout(timeout);
            }
            (build, options)
        };

        let mut result = StepResult::new();
        result.set_start_time_now();

        if self.check_cached_failure(step).await {
            result.step_status = BuildStatus::CachedFailure;
            result.set_stop_time_now();
            return self.inner_fail_job(step, None, result, build.id, 0).await;
        }

        let log_path = self.construct_log_file_path(&recipe_path).await?;
        log_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("failed to construct log path string"))?
            .clone_into(&mut result.log_file);

        let step_nr = {
            let mut conn = self.db.get().await?;
            let mut tx = conn.begin_transaction().await?;
            let step_nr = tx
                .create_build_step(CreateBuildStep {
                    start_time: Some(result.get_start_time_as_i32()?),
                    build_id: build.id,
                    recipe_path: &self.store.print_store_path(&recipe_path),
                    platform: step.get_platform().as_deref(),
                    machine: &machine.ssh_name,
                    status: BuildStatus::Busy,
                    error_msg: None,
                    propagated_from: None,
                    outputs: self.printed_outputs(step),
                })
                .await?;
            tx.commit().await?;
            step_nr
        };

        tracing::info!(
            "performing step '{recipe_path}' (attempt {tries}) on '{}' for build {}",
            machine.ssh_name,
            build.id
        );
        let res = remote::build_remote(&self.store, machine, step, &options, &log_path).await;
        result.set_stop_time_now();

        // attribute wall time to the machine and to every jobset the step
        // serves, win or lose
        let elapsed_ms = result.get_total_step_time_ms();
        self.metrics.total_step_time_ms.inc_by(elapsed_ms);
        let start_s = i64::from(result.get_start_time_as_i32()?);
        #[allow(clippy::cast_possible_wrap)]
        let duration_s = (elapsed_ms / 1000) as i64;
        for jobset in step.get_jobsets() {
            jobset.add_step(start_s, duration_s);
        }

        let status = match res {
            Ok(res) => {
                result.error_msg = res.error_msg;
                res.status
            }
            Err(remote::RemoteError::Connect(msg)) => {
                // the machine is at fault, not the step: demote the machine
                // and requeue the step without consuming a try
                machine.note_connect_failure(jiff::Timestamp::now());
                machine.stats.track_step_failure(elapsed_ms);
                self.metrics.nr_machine_connect_failures.inc();

                step.atomic_state.tries.fetch_sub(1, Ordering::Relaxed);
                result.step_status = BuildStatus::Aborted;
                result.error_msg = Some(msg);
                finish_build_step(
                    &self.db,
                    build.id,
                    step_nr,
                    &result,
                    Some(&machine.ssh_name),
                    &[],
                )
                .await?;
                self.runnable.push(step);
                self.trigger_dispatch();
                return Ok(());
            }
            Err(remote::RemoteError::Io(e)) => {
                result.error_msg = Some(e.to_string());
                RemoteStatus::MiscFailure
            }
        };
        result.update_with_remote_status(status);

        if status == RemoteStatus::Success {
            machine.stats.track_step_success(elapsed_ms);
            return self.succeed_step(step, machine, &build, result, step_nr).await;
        }
        machine.stats.track_step_failure(elapsed_ms);

        let (max_retries, retry_interval, retry_backoff) = self.config.get_retry();
        if result.can_retry && tries < max_retries {
            self.metrics.nr_retries.inc();
            if i64::from(tries) > self.metrics.max_nr_retries.get() {
                self.metrics.max_nr_retries.set(i64::from(tries));
            }

            let delta = retry_delay_secs(retry_interval, retry_backoff, tries);
            tracing::info!("will retry '{recipe_path}' after {delta}s");
            step.set_after(jiff::Timestamp::now() + jiff::SignedDuration::from_secs(delta));

            finish_build_step(
                &self.db,
                build.id,
                step_nr,
                &result,
                Some(&machine.ssh_name),
                &[],
            )
            .await?;
            self.runnable.push(step);
            self.trigger_dispatch();
            return Ok(());
        }

        self.inner_fail_job(step, Some(machine.clone()), result, build.id, step_nr)
            .await
    }

    /// Success propagation: finalize the builds whose top level this step
    /// is, then promote dependents whose last dependency this was.
    #[tracing::instrument(skip(self, step, machine, build, result), fields(recipe = %step.get_recipe_path()), err)]
    async fn succeed_step(
        &self,
        step: &Arc<Step>,
        machine: &Arc<Machine>,
        build: &Arc<Build>,
        result: StepResult,
        step_nr: i32,
    ) -> anyhow::Result<()> {
        step.set_finished(true);

        let output = BuildOutput::new(&self.store, step.get_outputs()).await;
        let db_outputs = output.as_db_outputs(&self.store);
        finish_build_step(
            &self.db,
            build.id,
            step_nr,
            &result,
            Some(&machine.ssh_name),
            &db_outputs,
        )
        .await?;

        let direct = step.get_direct_builds();
        {
            let mut conn = self.db.get().await?;
            let mut tx = conn.begin_transaction().await?;
            let start_time = result.get_start_time_as_i32()?;
            let stop_time = result.get_stop_time_as_i32()?;
            for b in &direct {
                // a build whose top-level was built for someone else's sake
                // is a cached success
                let is_cached = b.id != build.id;
                tracing::info!("marking build {} as succeeded", b.id);
                tx.mark_succeeded_build(MarkBuildSucceeded {
                    id: b.id,
                    start_time,
                    stop_time,
                    size: i64::try_from(output.size)?,
                    is_cached,
                    outputs: db_outputs.clone(),
                })
                .await?;
                self.metrics.nr_builds_done.inc();
            }
            tx.commit().await?;
        }

        if direct.is_empty() {
            self.steps.remove(step.get_recipe_path());
        }
        for b in direct {
            b.set_finished_in_db(true);
            self.builds.remove_by_id(b.id);
            self.notifications.enqueue(b.id, vec![]);
        }

        for newly_runnable in step.unlink_from_rdeps() {
            self.make_runnable(&newly_runnable);
        }

        if !result.log_file.is_empty() {
            self.log_compressor.enqueue(&result.log_file);
        }
        self.trigger_dispatch();

        Ok(())
    }

    /// Failure propagation: finalize every build in the step's dependent
    /// closure, recording a step row per build that cites the originating
    /// build.
    #[allow(clippy::too_many_lines)]
    #[tracing::instrument(skip(self, step, machine, result), fields(recipe = %step.get_recipe_path()), err)]
    async fn inner_fail_job(
        &self,
        step: &Arc<Step>,
        machine: Option<Arc<Machine>>,
        mut result: StepResult,
        originating_build_id: BuildID,
        step_nr: i32,
    ) -> anyhow::Result<()> {
        if !result.has_stop_time() {
            result.set_stop_time_now();
        }

        if step_nr != 0 {
            finish_build_step(
                &self.db,
                originating_build_id,
                step_nr,
                &result,
                machine.as_ref().map(|m| m.ssh_name.as_str()),
                &[],
            )
            .await?;
            if !result.log_file.is_empty() {
                self.log_compressor.enqueue(&result.log_file);
            }
        }

        let printed = self.store.print_store_path(step.get_recipe_path());
        let mut dependent_ids = Vec::new();
        let mut step_finished = false;
        loop {
            let indirect = self.get_all_indirect_builds(step);
            if indirect.is_empty() && step_finished {
                break;
            }

            {
                let mut conn = self.db.get().await?;
                let mut tx = conn.begin_transaction().await?;

                // Record a failed step row for every dependent build, except
                // where it would be redundant: the originating build already
                // has the real row, and a cached failure at a build's own
                // top level is already covered by its is_cached flag.
                for b in &indirect {
                    if b.get_finished_in_db() {
                        continue;
                    }
                    if b.id == originating_build_id
                        && result.step_status != BuildStatus::CachedFailure
                        && result.step_status != BuildStatus::Unsupported
                    {
                        continue;
                    }
                    if result.step_status == BuildStatus::CachedFailure
                        && b.recipe_path == *step.get_recipe_path()
                    {
                        continue;
                    }

                    tx.create_build_step(CreateBuildStep {
                        start_time: None,
                        build_id: b.id,
                        recipe_path: &printed,
                        platform: step.get_platform().as_deref(),
                        machine: machine.as_ref().map(|m| m.ssh_name.as_str()).unwrap_or(""),
                        status: result.step_status,
                        error_msg: result.error_msg.as_deref(),
                        propagated_from: (b.id != originating_build_id)
                            .then_some(originating_build_id),
                        outputs: self.printed_outputs(step),
                    })
                    .await?;
                }

                // Mark all builds that depend on this step as failed.
                let start_time = result.get_start_time_as_i32()?;
                let stop_time = result.get_stop_time_as_i32()?;
                for b in &indirect {
                    if b.get_finished_in_db() {
                        continue;
                    }

                    tracing::info!("marking build {} as failed", b.id);
                    let status = if b.recipe_path == *step.get_recipe_path() {
                        // the failing step is this build's own top level
                        match result.step_status {
                            BuildStatus::CachedFailure => BuildStatus::Failed,
                            s => s,
                        }
                    } else {
                        BuildStatus::DepFailed
                    };
                    tx.update_build_after_failure(
                        b.id,
                        status,
                        start_time,
                        stop_time,
                        result.step_status == BuildStatus::CachedFailure,
                    )
                    .await?;
                    self.metrics.nr_builds_done.inc();
                }

                // Remember failed output paths so the step is never built
                // again.
                if result.can_cache && result.step_status != BuildStatus::CachedFailure {
                    for o in step.get_outputs() {
                        let Some(p) = o.path else { continue };
                        tx.insert_failed_path(&self.store.print_store_path(&p))
                            .await?;
                    }
                }

                tx.commit().await?;
            }

            step_finished = true;

            // Dropping the builds releases their strong references; steps
            // reachable only through them are garbage-collected lazily.
            for b in indirect {
                b.set_finished_in_db(true);
                self.builds.remove_by_id(b.id);
                dependent_ids.push(b.id);
            }
        }

        self.notifications
            .enqueue(originating_build_id, dependent_ids);
        self.trigger_dispatch();

        Ok(())
    }

    #[tracing::instrument(skip(self, step))]
    fn get_all_indirect_builds(&self, step: &Arc<Step>) -> HashSet<Arc<Build>> {
        let mut indirect = HashSet::new();
        let mut steps = HashSet::new();
        step.get_dependents(&mut indirect, &mut steps);

        // If there are no builds left, delete all referring steps from the
        // steps map. No new referrers can appear for a failed step.
        if indirect.is_empty() {
            for s in steps {
                let recipe = s.get_recipe_path();
                tracing::debug!("finishing build step '{recipe}'");
                self.steps.remove(recipe);
            }
        }

        indirect
    }

    // ------------------------------------------------------------------
    // Background senders
    // ------------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub fn start_notification_sender_loop(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn(async move {
            loop {
                match self.notifications.send_once(&self.db).await {
                    Ok(()) => self.metrics.nr_notifications_sent.inc(),
                    Err(e) => tracing::error!("failed to send notification: {e}"),
                }
            }
        });
        task.abort_handle()
    }

    #[tracing::instrument(skip(self))]
    pub fn start_log_compressor_loop(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn(async move {
            loop {
                match self.log_compressor.compress_once().await {
                    Ok(()) => self.metrics.nr_logs_compressed.inc(),
                    Err(e) => tracing::error!("failed to compress log: {e}"),
                }
            }
        });
        task.abort_handle()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Wait for in-flight builder workers to settle, bounded by `timeout`.
    #[tracing::instrument(skip(self))]
    pub async fn drain(&self, timeout: std::time::Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let in_flight = self.machines.total_current_jobs();
            if in_flight == 0 {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!("giving up on {in_flight} in-flight steps after {timeout:?}");
                return;
            }
            tracing::info!("waiting for {in_flight} in-flight steps");
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }
}

/// Retry cooldown after the n-th attempt (1-based): grows by `backoff` per
/// failed attempt, starting at `interval` seconds.
fn retry_delay_secs(retry_interval: f32, retry_backoff: f32, tries: u32) -> i64 {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    ((retry_interval * retry_backoff.powf(tries.saturating_sub(1) as f32)) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_follows_backoff() {
        assert_eq!(retry_delay_secs(60.0, 3.0, 1), 60);
        assert_eq!(retry_delay_secs(60.0, 3.0, 2), 180);
        assert_eq!(retry_delay_secs(60.0, 3.0, 3), 540);
        assert_eq!(retry_delay_secs(60.0, 1.0, 5), 60);
    }
}
