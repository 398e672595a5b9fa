use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use hashbrown::HashMap;

pub type JobsetID = i32;

/// Fairness window: only CPU seconds spent within the last 24 hours count
/// towards a jobset's share usage.
pub const SCHEDULING_WINDOW: i64 = 24 * 60 * 60;

#[derive(Debug)]
pub struct Jobset {
    pub id: JobsetID,
    pub project_name: String,
    pub name: String,

    seconds: AtomicI64,
    shares: AtomicU32,
    // Start time and duration of the build steps inside the window.
    steps: parking_lot::RwLock<BTreeMap<i64, i64>>,
}

impl PartialEq for Jobset {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.project_name == other.project_name && self.name == other.name
    }
}

impl Eq for Jobset {}

impl std::hash::Hash for Jobset {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.project_name.hash(state);
        self.name.hash(state);
    }
}

impl Jobset {
    pub fn new<S: Into<String>>(id: JobsetID, project_name: S, name: S) -> Self {
        Self {
            id,
            project_name: project_name.into(),
            name: name.into(),
            seconds: 0.into(),
            shares: 1.into(),
            steps: parking_lot::RwLock::new(BTreeMap::new()),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}:{}", self.project_name, self.name)
    }

    /// CPU seconds inside the window divided by the share count; the
    /// dispatcher favors the smallest value.
    pub fn share_used(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let used = self.seconds.load(Ordering::Relaxed) as f64;
        used / f64::from(self.shares.load(Ordering::Relaxed).max(1))
    }

    pub fn set_shares(&self, shares: i32) -> anyhow::Result<()> {
        let shares = u32::try_from(shares)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| anyhow::anyhow!("share count must be positive, got {shares}"))?;
        self.shares.store(shares, Ordering::Relaxed);
        Ok(())
    }

    pub fn get_seconds(&self) -> i64 {
        self.seconds.load(Ordering::Relaxed)
    }

    pub fn add_step(&self, start_time: i64, duration: i64) {
        let mut steps = self.steps.write();
        // two steps may start in the same second, keep both durations
        *steps.entry(start_time).or_insert(0) += duration;
        self.seconds.fetch_add(duration, Ordering::Relaxed);
    }

    /// Drop every sample that started before the window and settle their
    /// durations against the running total.
    pub fn prune_steps(&self) {
        let cutoff = jiff::Timestamp::now().as_second() - SCHEDULING_WINDOW;
        let mut steps = self.steps.write();

        let kept = steps.split_off(&cutoff);
        let expired: i64 = steps.values().sum();
        *steps = kept;
        if expired != 0 {
            self.seconds.fetch_sub(expired, Ordering::Relaxed);
        }
    }
}

// Projectname, Jobsetname
type JobsetName = (String, String);

#[derive(Clone)]
pub struct Jobsets {
    inner: Arc<parking_lot::RwLock<HashMap<JobsetName, Arc<Jobset>>>>,
}

impl Default for Jobsets {
    fn default() -> Self {
        Self::new()
    }
}

impl Jobsets {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(HashMap::with_capacity(100))),
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

    #[tracing::instrument(skip(self))]
    pub fn prune(&self) {
        let jobsets = self.inner.read();
        for ((project_name, jobset_name), jobset) in jobsets.iter() {
            let s1 = jobset.share_used();
            jobset.prune_steps();
            let s2 = jobset.share_used();
            if (s1 - s2).abs() > f64::EPSILON {
                tracing::debug!(
                    "pruned scheduling window of '{project_name}:{jobset_name}' from {s1} to {s2}"
                );
            }
        }
    }

    /// Look up or create the jobset, seeding its share count and fairness
    /// window from the database on first reference.
    #[tracing::instrument(skip(self, conn), err)]
    pub async fn create(
        &self,
        conn: &mut db::Connection,
        jobset_id: JobsetID,
        project_name: &str,
        jobset_name: &str,
    ) -> anyhow::Result<Arc<Jobset>> {
        let key = (project_name.to_owned(), jobset_name.to_owned());
        {
            let jobsets = self.inner.read();
            if let Some(jobset) = jobsets.get(&key) {
                return Ok(jobset.clone());
            }
        }

        let shares = conn
            .get_jobset_scheduling_shares(jobset_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("scheduling shares not found for jobset"))?;
        let jobset = Jobset::new(jobset_id, project_name, jobset_name);
        jobset.set_shares(shares)?;

        for step in conn
            .get_jobset_build_steps(jobset_id, SCHEDULING_WINDOW)
            .await?
        {
            let Some(start_time) = step.start_time else {
                continue;
            };
            let Some(stop_time) = step.stop_time else {
                continue;
            };
            jobset.add_step(i64::from(start_time), i64::from(stop_time - start_time));
        }

        let jobset = Arc::new(jobset);
        {
            let mut jobsets = self.inner.write();
            jobsets.insert(key, jobset.clone());
        }

        Ok(jobset)
    }

    #[tracing::instrument(skip(self, conn), err)]
    pub async fn handle_change(&self, conn: &mut db::Connection) -> anyhow::Result<()> {
        let curr_jobsets_in_db = conn.get_jobsets().await?;

        let jobsets = self.inner.read();
        for row in curr_jobsets_in_db {
            if let Some(i) = jobsets.get(&(row.project.clone(), row.name.clone()))
                && let Err(e) = i.set_shares(row.scheduling_shares)
            {
                tracing::error!(
                    "Failed to update jobset scheduling shares. project_name={} jobset_name={} e={}",
                    row.project,
                    row.name,
                    e,
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_used_divides_by_shares() {
        let jobset = Jobset::new(1, "proj", "nightly");
        let now = jiff::Timestamp::now().as_second();
        jobset.add_step(now, 600);

        assert!((jobset.share_used() - 600.0).abs() < f64::EPSILON);
        jobset.set_shares(4).unwrap();
        assert!((jobset.share_used() - 150.0).abs() < f64::EPSILON);

        assert!(jobset.set_shares(0).is_err());
        assert!(jobset.set_shares(-3).is_err());
    }

    #[test]
    fn test_add_step_merges_same_start_second() {
        let jobset = Jobset::new(1, "proj", "nightly");
        let now = jiff::Timestamp::now().as_second();
        jobset.add_step(now, 10);
        jobset.add_step(now, 20);

        assert_eq!(jobset.get_seconds(), 30);
    }

    #[test]
    fn test_prune_drops_samples_outside_window() {
        let jobset = Jobset::new(1, "proj", "nightly");
        let now = jiff::Timestamp::now().as_second();
        jobset.add_step(now - SCHEDULING_WINDOW - 100, 500);
        jobset.add_step(now - 60, 120);
        assert_eq!(jobset.get_seconds(), 620);

        jobset.prune_steps();
        assert_eq!(jobset.get_seconds(), 120);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let jobset = Jobset::new(1, "proj", "nightly");
        let now = jiff::Timestamp::now().as_second();
        jobset.add_step(now - 30, 42);

        jobset.prune_steps();
        jobset.prune_steps();
        assert_eq!(jobset.get_seconds(), 42);
    }
}
