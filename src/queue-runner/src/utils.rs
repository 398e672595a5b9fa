use backon::Retryable as _;

use db::models::{BuildID, BuildStatus, FinishBuildStep};

use crate::state::StepResult;

/// Write the terminal state of a build step row. On success the output rows
/// are updated with the realized paths.
#[tracing::instrument(skip(database, res, outputs), err)]
pub async fn finish_build_step(
    database: &db::Database,
    build_id: BuildID,
    step_nr: i32,
    res: &StepResult,
    machine: Option<&str>,
    outputs: &[(String, String)],
) -> anyhow::Result<()> {
    let mut conn = database.get().await?;
    let mut tx = conn.begin_transaction().await?;

    debug_assert!(res.has_start_time());
    debug_assert!(res.has_stop_time());
    tracing::info!(
        "writing build step result. step_status={:?} start_time={:?} stop_time={:?}",
        res.step_status,
        res.get_start_time_as_i32(),
        res.get_stop_time_as_i32(),
    );
    tx.finish_build_step(FinishBuildStep {
        build_id,
        step_nr,
        status: res.step_status,
        error_msg: res.error_msg.as_deref(),
        start_time: res.get_start_time_as_i32()?,
        stop_time: res.get_stop_time_as_i32()?,
        machine,
    })
    .await?;

    tx.notify_step_finished(build_id, step_nr, &res.log_file)
        .await?;

    if res.step_status == BuildStatus::Success {
        for (name, path) in outputs {
            tx.update_build_step_output(build_id, step_nr, name, path)
                .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Run a database operation with jittered exponential backoff. Serialization
/// failures and connection drops are worth retrying; anything still failing
/// after the last attempt is returned.
pub async fn retry_db<T, F, Fut>(op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    op.retry(
        backon::ExponentialBuilder::default()
            .with_jitter()
            .with_max_times(10),
    )
    .notify(|err, dur| tracing::warn!("database operation failed, retrying in {dur:?}: {err}"))
    .await
}
