use sqlx::Acquire as _;

use super::models::{
    Build, BuildID, BuildSmall, BuildStatus, CreateBuildStep, FinishBuildStep, Jobset,
    MarkBuildSucceeded, StepType, StepTiming,
};

pub struct Connection {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

pub struct Transaction<'a> {
    tx: sqlx::PgTransaction<'a>,
}

impl Connection {
    #[must_use]
    pub const fn new(conn: sqlx::pool::PoolConnection<sqlx::Postgres>) -> Self {
        Self { conn }
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn begin_transaction(&mut self) -> sqlx::Result<Transaction<'_>> {
        let tx = self.conn.begin().await?;
        Ok(Transaction { tx })
    }

    /// Builds still queued, restricted to ids above the monitor's watermark.
    #[tracing::instrument(skip(self), err)]
    pub async fn get_queued_builds(&mut self, since_id: BuildID) -> sqlx::Result<Vec<Build>> {
        sqlx::query_as::<_, Build>(
            r"
            SELECT
              builds.id,
              builds.jobset_id,
              jobsets.project AS project,
              jobsets.name AS jobset,
              job,
              recipe_path,
              max_silent,
              timeout,
              timestamp,
              global_priority,
              priority
            FROM builds
            INNER JOIN jobsets ON builds.jobset_id = jobsets.id
            WHERE finished = 0 AND builds.id > $1
            ORDER BY global_priority DESC, builds.id",
        )
        .bind(since_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_not_finished_builds_fast(&mut self) -> sqlx::Result<Vec<BuildSmall>> {
        sqlx::query_as::<_, BuildSmall>(
            "SELECT id, global_priority FROM builds WHERE finished = 0",
        )
        .fetch_all(&mut *self.conn)
        .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_jobsets(&mut self) -> sqlx::Result<Vec<Jobset>> {
        sqlx::query_as::<_, Jobset>("SELECT project, name, scheduling_shares FROM jobsets")
            .fetch_all(&mut *self.conn)
            .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_jobset_scheduling_shares(
        &mut self,
        jobset_id: i32,
    ) -> sqlx::Result<Option<i32>> {
        sqlx::query_scalar::<_, i32>("SELECT scheduling_shares FROM jobsets WHERE id = $1")
            .bind(jobset_id)
            .fetch_optional(&mut *self.conn)
            .await
    }

    /// Recent step timings for a jobset, used to seed its fairness window.
    #[tracing::instrument(skip(self), err)]
    pub async fn get_jobset_build_steps(
        &mut self,
        jobset_id: i32,
        scheduling_window: i64,
    ) -> sqlx::Result<Vec<StepTiming>> {
        sqlx::query_as::<_, StepTiming>(
            r"
            SELECT s.start_time, s.stop_time
            FROM buildsteps s JOIN builds b ON s.build = b.id
            WHERE
              s.start_time IS NOT NULL AND
              to_timestamp(s.stop_time) > (NOW() - (interval '1 second' * $1)) AND
              b.jobset_id = $2",
        )
        .bind(scheduling_window)
        .bind(jobset_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn clear_busy(&mut self, stop_time: i32) -> sqlx::Result<()> {
        sqlx::query("UPDATE buildsteps SET busy = 0, status = $1, stop_time = $2 WHERE busy != 0")
            .bind(BuildStatus::Aborted as i32)
            .bind(stop_time)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn abort_build(&mut self, build_id: BuildID, error_msg: &str) -> sqlx::Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let now = jiff::Timestamp::now().as_second() as i32;
        sqlx::query(
            r"UPDATE builds
              SET finished = 1, build_status = $2, start_time = $3, stop_time = $3, error_msg = $4
              WHERE id = $1 AND finished = 0",
        )
        .bind(build_id)
        .bind(BuildStatus::Aborted as i32)
        .bind(now)
        .bind(error_msg)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, paths), err)]
    pub async fn check_if_paths_failed(&mut self, paths: &[String]) -> sqlx::Result<bool> {
        Ok(
            !sqlx::query("SELECT path FROM failedpaths WHERE path = ANY($1)")
                .bind(paths)
                .fetch_all(&mut *self.conn)
                .await?
                .is_empty(),
        )
    }

    /// The build whose step last failed for this recipe, for `propagated_from`
    /// attribution on cached failures.
    #[tracing::instrument(skip(self), err)]
    pub async fn get_last_failed_step_build(
        &mut self,
        recipe_path: &str,
    ) -> sqlx::Result<Option<BuildID>> {
        sqlx::query_scalar::<_, Option<BuildID>>(
            r"SELECT max(build) FROM buildsteps
              WHERE recipe_path = $1 AND start_time IS NOT NULL AND status = $2",
        )
        .bind(recipe_path)
        .bind(BuildStatus::Failed as i32)
        .fetch_one(&mut *self.conn)
        .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_last_failed_step_build_for_output(
        &mut self,
        output_path: &str,
    ) -> sqlx::Result<Option<BuildID>> {
        sqlx::query_scalar::<_, Option<BuildID>>(
            r"SELECT max(s.build) FROM buildsteps s
              JOIN buildstepoutputs o ON s.build = o.build AND s.step_nr = o.step_nr
              WHERE o.path = $1 AND s.status = $2",
        )
        .bind(output_path)
        .bind(BuildStatus::Failed as i32)
        .fetch_one(&mut *self.conn)
        .await
    }
}

impl Transaction<'_> {
    #[tracing::instrument(skip(self), err)]
    pub async fn commit(self) -> sqlx::Result<()> {
        self.tx.commit().await
    }

    async fn alloc_step_nr(&mut self, build_id: BuildID) -> sqlx::Result<i32> {
        let max: Option<i32> =
            sqlx::query_scalar("SELECT max(step_nr) FROM buildsteps WHERE build = $1")
                .bind(build_id)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// Insert a build step row plus its output rows and return the step
    /// number, allocated monotonically per build inside this transaction.
    #[tracing::instrument(skip(self, step), err)]
    pub async fn create_build_step(&mut self, step: CreateBuildStep<'_>) -> sqlx::Result<i32> {
        let step_nr = self.alloc_step_nr(step.build_id).await?;
        sqlx::query(
            r"INSERT INTO buildsteps
              (build, step_nr, type, recipe_path, busy, status, start_time,
               platform, propagated_from, error_msg, machine)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(step.build_id)
        .bind(step_nr)
        .bind(StepType::Build as i32)
        .bind(step.recipe_path)
        .bind(i32::from(step.status == BuildStatus::Busy))
        .bind(if step.status == BuildStatus::Busy {
            None
        } else {
            Some(step.status as i32)
        })
        .bind(step.start_time)
        .bind(step.platform)
        .bind(step.propagated_from)
        .bind(step.error_msg)
        .bind(step.machine)
        .execute(&mut *self.tx)
        .await?;

        for (name, path) in step.outputs {
            sqlx::query(
                "INSERT INTO buildstepoutputs (build, step_nr, name, path) VALUES ($1, $2, $3, $4)",
            )
            .bind(step.build_id)
            .bind(step_nr)
            .bind(name)
            .bind(path)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(step_nr)
    }

    #[tracing::instrument(skip(self, step), err)]
    pub async fn finish_build_step(&mut self, step: FinishBuildStep<'_>) -> sqlx::Result<()> {
        sqlx::query(
            r"UPDATE buildsteps
              SET busy = 0, status = $3, error_msg = $4,
                  start_time = $5, stop_time = $6, machine = coalesce($7, machine)
              WHERE build = $1 AND step_nr = $2",
        )
        .bind(step.build_id)
        .bind(step.step_nr)
        .bind(step.status as i32)
        .bind(step.error_msg)
        .bind(step.start_time)
        .bind(step.stop_time)
        .bind(step.machine)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, output), err)]
    pub async fn create_substitution_step(
        &mut self,
        start_time: i32,
        stop_time: i32,
        build_id: BuildID,
        recipe_path: &str,
        output: (String, Option<String>),
    ) -> sqlx::Result<i32> {
        let step_nr = self.alloc_step_nr(build_id).await?;
        sqlx::query(
            r"INSERT INTO buildsteps
              (build, step_nr, type, recipe_path, busy, status, start_time, stop_time, machine)
              VALUES ($1, $2, $3, $4, 0, $5, $6, $7, '')",
        )
        .bind(build_id)
        .bind(step_nr)
        .bind(StepType::Substitution as i32)
        .bind(recipe_path)
        .bind(BuildStatus::Success as i32)
        .bind(start_time)
        .bind(stop_time)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            "INSERT INTO buildstepoutputs (build, step_nr, name, path) VALUES ($1, $2, $3, $4)",
        )
        .bind(build_id)
        .bind(step_nr)
        .bind(output.0)
        .bind(output.1)
        .execute(&mut *self.tx)
        .await?;

        Ok(step_nr)
    }

    #[tracing::instrument(skip(self, build), fields(build_id = build.id), err)]
    pub async fn mark_succeeded_build(&mut self, build: MarkBuildSucceeded) -> sqlx::Result<()> {
        sqlx::query(
            r"UPDATE builds
              SET finished = 1, build_status = $2, start_time = $3, stop_time = $4,
                  size = $5, is_cached_build = $6
              WHERE id = $1 AND finished = 0",
        )
        .bind(build.id)
        .bind(BuildStatus::Success as i32)
        .bind(build.start_time)
        .bind(build.stop_time)
        .bind(build.size)
        .bind(i32::from(build.is_cached))
        .execute(&mut *self.tx)
        .await?;

        sqlx::query("DELETE FROM buildoutputs WHERE build = $1")
            .bind(build.id)
            .execute(&mut *self.tx)
            .await?;
        for (name, path) in build.outputs {
            sqlx::query("INSERT INTO buildoutputs (build, name, path) VALUES ($1, $2, $3)")
                .bind(build.id)
                .bind(name)
                .bind(path)
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn update_build_after_failure(
        &mut self,
        build_id: BuildID,
        status: BuildStatus,
        start_time: i32,
        stop_time: i32,
        is_cached_build: bool,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r"UPDATE builds
              SET finished = 1, build_status = $2, start_time = $3, stop_time = $4,
                  is_cached_build = $5
              WHERE id = $1 AND finished = 0",
        )
        .bind(build_id)
        .bind(status as i32)
        .bind(start_time)
        .bind(stop_time)
        .bind(i32::from(is_cached_build))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn update_build_after_previous_failure(
        &mut self,
        build_id: BuildID,
        status: BuildStatus,
    ) -> sqlx::Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let now = jiff::Timestamp::now().as_second() as i32;
        sqlx::query(
            r"UPDATE builds
              SET finished = 1, build_status = $2, start_time = $3, stop_time = $3,
                  is_cached_build = 1
              WHERE id = $1 AND finished = 0",
        )
        .bind(build_id)
        .bind(status as i32)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn insert_failed_path(&mut self, path: &str) -> sqlx::Result<()> {
        sqlx::query("INSERT INTO failedpaths (path) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(path)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn update_build_step_output(
        &mut self,
        build_id: BuildID,
        step_nr: i32,
        name: &str,
        path: &str,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE buildstepoutputs SET path = $4 WHERE build = $1 AND step_nr = $2 AND name = $3",
        )
        .bind(build_id)
        .bind(step_nr)
        .bind(name)
        .bind(path)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, dependent_ids), err)]
    pub async fn notify_build_finished(
        &mut self,
        build_id: BuildID,
        dependent_ids: &[BuildID],
    ) -> sqlx::Result<()> {
        let payload = std::iter::once(build_id)
            .chain(dependent_ids.iter().copied())
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join("\t");
        sqlx::query("SELECT pg_notify('build_finished', $1)")
            .bind(payload)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn notify_step_finished(
        &mut self,
        build_id: BuildID,
        step_nr: i32,
        log_file: &str,
    ) -> sqlx::Result<()> {
        sqlx::query("SELECT pg_notify('step_finished', $1)")
            .bind(format!("{build_id}\t{step_nr}\t{log_file}"))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}
