use std::sync::{Arc, atomic::Ordering};

use hashbrown::HashMap;
use smallvec::SmallVec;

use super::Step;

/// Cap on how long consecutive connect failures can disable a machine.
const MAX_DISABLE_SECS: i64 = 4 * 60 * 60;
const DISABLE_BASE_SECS: i64 = 60;

#[derive(Debug)]
pub struct Stats {
    current_jobs: std::sync::atomic::AtomicU64,
    nr_steps_done: std::sync::atomic::AtomicU64,
    failed_steps: std::sync::atomic::AtomicU64,
    succeeded_steps: std::sync::atomic::AtomicU64,
    total_step_time_ms: std::sync::atomic::AtomicU64,
    idle_since: std::sync::atomic::AtomicI64,

    // connect failure tracking; a disabled machine is skipped by the
    // dispatcher until disabled_until
    last_failure: std::sync::atomic::AtomicI64,
    disabled_until: std::sync::atomic::AtomicI64,
    consecutive_failures: std::sync::atomic::AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current_jobs: 0.into(),
            nr_steps_done: 0.into(),
            failed_steps: 0.into(),
            succeeded_steps: 0.into(),
            total_step_time_ms: 0.into(),
            idle_since: (jiff::Timestamp::now().as_second()).into(),
            last_failure: 0.into(),
            disabled_until: 0.into(),
            consecutive_failures: 0.into(),
        }
    }

    /// Called when a reservation takes a slot. A busy machine is not idle.
    fn job_started(&self) {
        self.current_jobs.fetch_add(1, Ordering::Relaxed);
        self.idle_since.store(0, Ordering::Relaxed);
    }

    /// Called when a reservation releases its slot; stamps `idle_since` when
    /// the last job leaves.
    fn job_finished(&self) {
        let left = self
            .current_jobs
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        if left == 0 {
            self.idle_since
                .store(jiff::Timestamp::now().as_second(), Ordering::Relaxed);
        }
        self.nr_steps_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_current_jobs(&self) -> u64 {
        self.current_jobs.load(Ordering::Relaxed)
    }

    pub fn get_nr_steps_done(&self) -> u64 {
        self.nr_steps_done.load(Ordering::Relaxed)
    }

    pub fn get_idle_since(&self) -> i64 {
        self.idle_since.load(Ordering::Relaxed)
    }

    pub fn get_last_failure(&self) -> i64 {
        self.last_failure.load(Ordering::Relaxed)
    }

    pub fn get_disabled_until(&self) -> i64 {
        self.disabled_until.load(Ordering::Relaxed)
    }

    pub fn get_consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn track_step_success(&self, total_step_time_ms: u64) {
        self.succeeded_steps.fetch_add(1, Ordering::Relaxed);
        self.total_step_time_ms
            .fetch_add(total_step_time_ms, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.disabled_until.store(0, Ordering::Relaxed);
    }

    pub fn track_step_failure(&self, total_step_time_ms: u64) {
        self.failed_steps.fetch_add(1, Ordering::Relaxed);
        self.total_step_time_ms
            .fetch_add(total_step_time_ms, Ordering::Relaxed);
    }

    pub fn get_total_step_time_ms(&self) -> u64 {
        self.total_step_time_ms.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct Machine {
    pub ssh_name: String,
    pub ssh_key: Option<String>,
    pub systems: SmallVec<[String; 4]>,
    pub supported_features: SmallVec<[String; 8]>,
    pub mandatory_features: SmallVec<[String; 4]>,
    pub max_jobs: u32,
    pub speed_factor: f32,
    pub ssh_public_host_key: Option<String>,

    pub stats: Arc<Stats>,
    // one transfer to a machine at a time; leaf lock, never held across
    // another lock
    pub send_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Machine: [name={} systems={:?} max_jobs={} speed_factor={:.2} features={:?}]",
            self.ssh_name, self.systems, self.max_jobs, self.speed_factor, self.supported_features,
        )
    }
}

fn split_list(field: &str) -> SmallVec<[String; 4]> {
    if field == "-" {
        return SmallVec::new();
    }
    field
        .split(',')
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

impl Machine {
    /// Parse one line of the machine inventory:
    /// `name systems ssh-key max-jobs speed-factor features mandatory host-key`.
    /// Trailing fields may be omitted; `-` means empty.
    #[tracing::instrument(err)]
    pub fn parse_line(line: &str) -> anyhow::Result<Self> {
        let mut fields = line.split_whitespace();
        let ssh_name = fields
            .next()
            .ok_or_else(|| anyhow::anyhow!("machine line is empty"))?
            .to_owned();
        let systems: SmallVec<[String; 4]> = fields
            .next()
            .map(split_list)
            .ok_or_else(|| anyhow::anyhow!("machine '{ssh_name}' has no system types"))?;
        if systems.is_empty() {
            return Err(anyhow::anyhow!("machine '{ssh_name}' has no system types"));
        }

        let ssh_key = fields.next().filter(|v| *v != "-").map(ToOwned::to_owned);
        let max_jobs: u32 = fields.next().map_or(Ok(1), str::parse)?;
        let speed_factor: f32 = fields.next().map_or(Ok(1.0), str::parse)?;
        let supported_features = fields.next().map(split_list).unwrap_or_default().into_vec();
        let mandatory_features = fields.next().map(split_list).unwrap_or_default();
        let ssh_public_host_key = fields.next().filter(|v| *v != "-").map(ToOwned::to_owned);

        // mandatory features are implicitly supported
        let mut supported: SmallVec<[String; 8]> = supported_features.into();
        for f in &mandatory_features {
            if !supported.contains(f) {
                supported.push(f.clone());
            }
        }

        Ok(Self {
            ssh_name,
            ssh_key,
            systems,
            supported_features: supported,
            mandatory_features,
            max_jobs,
            speed_factor,
            ssh_public_host_key,
            stats: Arc::new(Stats::new()),
            send_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// A machine can serve a step when it advertises the step's platform,
    /// all the step's required features are supported, and every mandatory
    /// feature of the machine is required by the step (steps preferring a
    /// local build get a pass on the `local` feature).
    #[must_use]
    pub fn supports_step(&self, step: &Arc<Step>) -> bool {
        let Some(platform) = step.get_platform() else {
            return false;
        };
        if !self.systems.contains(&platform) {
            return false;
        }

        let required = step.get_required_features();
        for f in &self.mandatory_features {
            if !required.contains(f) && !(step.get_prefer_local() && f == "local") {
                return false;
            }
        }
        required.iter().all(|f| self.supported_features.contains(f))
    }

    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.stats.get_current_jobs() < u64::from(self.max_jobs)
    }

    #[must_use]
    pub fn is_disabled(&self, now: jiff::Timestamp) -> bool {
        self.stats.get_disabled_until() > now.as_second()
    }

    /// Load-balancing score: fastest machine with the fewest running jobs
    /// wins.
    #[must_use]
    pub fn load_score(&self) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        (self.speed_factor / ((self.stats.get_current_jobs() + 1) as f32))
    }

    /// Record a connect/handshake failure and disable the machine for an
    /// exponentially growing, bounded interval.
    pub fn note_connect_failure(&self, now: jiff::Timestamp) {
        let failures = self
            .stats
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        self.stats
            .last_failure
            .store(now.as_second(), Ordering::Relaxed);

        let exp = u32::try_from(failures.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
        let delta = DISABLE_BASE_SECS
            .saturating_mul(1_i64 << exp)
            .min(MAX_DISABLE_SECS);
        self.stats
            .disabled_until
            .store(now.as_second() + delta, Ordering::Relaxed);
        tracing::warn!(
            "disabling machine '{}' for {delta}s after {failures} consecutive failures",
            self.ssh_name
        );
    }
}

struct MachinesInner {
    by_name: HashMap<String, Arc<Machine>>,
    by_system: HashMap<String, Vec<Arc<Machine>>>,
}

impl MachinesInner {
    fn rebuild_index(&mut self) {
        self.by_system.clear();
        for machine in self.by_name.values() {
            for system in &machine.systems {
                self.by_system
                    .entry(system.clone())
                    .or_default()
                    .push(machine.clone());
            }
        }
    }
}

/// The build machine inventory. Reload swaps the whole map; reservations
/// keep removed machines alive through their `Arc` until the step settles.
pub struct Machines {
    inner: parking_lot::RwLock<MachinesInner>,
}

impl Default for Machines {
    fn default() -> Self {
        Self::new()
    }
}

impl Machines {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(MachinesInner {
                by_name: HashMap::with_capacity(10),
                by_system: HashMap::with_capacity(10),
            }),
        }
    }

    /// Parse the §machines file contents. Broken lines are skipped with a
    /// warning so one typo does not empty the farm.
    #[must_use]
    pub fn parse_inventory(contents: &str) -> Vec<Machine> {
        let mut machines = Vec::new();
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            match Machine::parse_line(line) {
                Ok(m) => machines.push(m),
                Err(e) => tracing::warn!("skipping malformed machine line '{line}': {e}"),
            }
        }
        machines
    }

    /// Atomically replace the inventory, carrying over the mutable stats of
    /// machines whose name survived so job counts and failure cool-downs are
    /// not forgotten across reloads.
    pub fn replace_all(&self, new_machines: Vec<Machine>) {
        let mut inner = self.inner.write();
        let mut by_name = HashMap::with_capacity(new_machines.len());
        for mut machine in new_machines {
            if let Some(old) = inner.by_name.get(&machine.ssh_name) {
                machine.stats = old.stats.clone();
                machine.send_lock = old.send_lock.clone();
            }
            by_name.insert(machine.ssh_name.clone(), Arc::new(machine));
        }
        inner.by_name = by_name;
        inner.rebuild_index();
    }

    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Machine>> {
        self.inner.read().by_name.get(name).cloned()
    }

    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<Machine>> {
        self.inner.read().by_name.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner
            .read()
            .by_name
            .values()
            .filter(|m| m.stats.get_current_jobs() > 0)
            .count()
    }

    pub fn total_current_jobs(&self) -> u64 {
        self.inner
            .read()
            .by_name
            .values()
            .map(|m| m.stats.get_current_jobs())
            .sum()
    }

    /// Whether any configured machine could ever run this step, ignoring
    /// load and cool-downs. Steps failing this check are unsupported.
    #[must_use]
    pub fn supports_step(&self, step: &Arc<Step>) -> bool {
        let Some(platform) = step.get_platform() else {
            return false;
        };
        let inner = self.inner.read();
        inner
            .by_system
            .get(&platform)
            .is_some_and(|machines| machines.iter().any(|m| m.supports_step(step)))
    }

    /// Best machine for a step right now: supporting, below its job limit,
    /// not in a failure cool-down, maximizing the load score.
    #[must_use]
    pub fn find_best(&self, step: &Arc<Step>, now: jiff::Timestamp) -> Option<Arc<Machine>> {
        let Some(platform) = step.get_platform() else {
            return None;
        };
        let inner = self.inner.read();
        inner
            .by_system
            .get(&platform)?
            .iter()
            .filter(|m| m.supports_step(step) && m.has_capacity() && !m.is_disabled(now))
            .max_by(|a, b| {
                a.load_score().total_cmp(&b.load_score()).then_with(|| {
                    b.stats
                        .get_current_jobs()
                        .cmp(&a.stats.get_current_jobs())
                })
            })
            .cloned()
    }
}

/// A lease on one job slot of one machine for one step. Creating it takes
/// the slot; dropping it releases the slot and wakes the dispatcher. At most
/// one reservation exists per active (step, machine) pair.
pub struct MachineReservation {
    pub machine: Arc<Machine>,
    pub step: Arc<Step>,
    wake_dispatcher: Arc<tokio::sync::Notify>,
}

impl MachineReservation {
    #[must_use]
    pub fn new(
        machine: Arc<Machine>,
        step: Arc<Step>,
        wake_dispatcher: Arc<tokio::sync::Notify>,
    ) -> Self {
        machine.stats.job_started();
        Self {
            machine,
            step,
            wake_dispatcher,
        }
    }
}

impl Drop for MachineReservation {
    fn drop(&mut self) {
        self.machine.stats.job_finished();
        self.wake_dispatcher.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = "\
# test farm
builder1.example.org x86_64-linux /etc/keys/b1 4 2.0 kvm,big-parallel - -
builder2.example.org x86_64-linux,i686-linux - 2 1.0 - - -
mac1.example.org aarch64-darwin /etc/keys/mac 1 1.0 big-parallel apple-silicon -

broken-line
";

    fn step_for(platform: &str, features: &[&str]) -> Arc<Step> {
        let step = Step::new(store::StorePath::new(
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-test.recipe",
        ));
        let features_json = features
            .iter()
            .map(|f| format!("\"{f}\""))
            .collect::<Vec<_>>()
            .join(",");
        let json = format!(
            r#"{{"platform": "{platform}", "outputs": {{"out": "cccccccccccccccccccccccccccccccc-out"}}, "requiredFeatures": [{features_json}]}}"#
        );
        step.set_recipe(store::Recipe::parse(&json).unwrap());
        step
    }

    #[test]
    fn test_parse_inventory() {
        let machines = Machines::parse_inventory(INVENTORY);
        assert_eq!(machines.len(), 3);

        let b1 = &machines[0];
        assert_eq!(b1.ssh_name, "builder1.example.org");
        assert_eq!(b1.max_jobs, 4);
        assert!((b1.speed_factor - 2.0).abs() < f32::EPSILON);
        assert_eq!(b1.supported_features.len(), 2);
        assert!(b1.ssh_key.is_some());

        let b2 = &machines[1];
        assert_eq!(b2.systems.len(), 2);
        assert!(b2.ssh_key.is_none());
        assert_eq!(b2.max_jobs, 2);

        // mandatory features count as supported
        let mac = &machines[2];
        assert!(mac.supported_features.contains(&"apple-silicon".into()));
    }

    #[test]
    fn test_parse_line_defaults() {
        let m = Machine::parse_line("host x86_64-linux").unwrap();
        assert_eq!(m.max_jobs, 1);
        assert!((m.speed_factor - 1.0).abs() < f32::EPSILON);
        assert!(m.supported_features.is_empty());
    }

    #[test]
    fn test_supports_step() {
        let machines = Machines::parse_inventory(INVENTORY);

        let plain = step_for("x86_64-linux", &[]);
        let kvm = step_for("x86_64-linux", &["kvm"]);
        let exotic = step_for("x86_64-linux", &["big-parallel", "cuda"]);
        let darwin = step_for("aarch64-darwin", &["big-parallel"]);

        assert!(machines[0].supports_step(&plain));
        assert!(machines[0].supports_step(&kvm));
        assert!(!machines[0].supports_step(&exotic)); // cuda unsupported
        assert!(machines[1].supports_step(&plain));
        assert!(!machines[1].supports_step(&kvm));

        // mandatory feature not required by the step
        assert!(!machines[2].supports_step(&darwin));
        let darwin_mandatory = step_for("aarch64-darwin", &["big-parallel", "apple-silicon"]);
        assert!(machines[2].supports_step(&darwin_mandatory));
    }

    #[test]
    fn test_unsupported_when_no_machine_advertises_feature() {
        let ms = Machines::new();
        ms.replace_all(Machines::parse_inventory(INVENTORY));

        let step = step_for("x86_64-linux", &["big-parallel", "cuda"]);
        assert!(!ms.supports_step(&step));
        assert!(ms.find_best(&step, jiff::Timestamp::now()).is_none());
    }

    #[test]
    fn test_find_best_prefers_fast_idle_machine() {
        let ms = Machines::new();
        ms.replace_all(Machines::parse_inventory(INVENTORY));
        let step = step_for("x86_64-linux", &[]);

        let best = ms.find_best(&step, jiff::Timestamp::now()).unwrap();
        assert_eq!(best.ssh_name, "builder1.example.org");

        // load the fast machine down: score 2.0/4 < 1.0/1
        for _ in 0..3 {
            best.stats.job_started();
        }
        let next = ms.find_best(&step, jiff::Timestamp::now()).unwrap();
        assert_eq!(next.ssh_name, "builder2.example.org");
    }

    #[test]
    fn test_find_best_skips_disabled() {
        let ms = Machines::new();
        ms.replace_all(Machines::parse_inventory(
            "only.example.org x86_64-linux - 1 1.0",
        ));
        let step = step_for("x86_64-linux", &[]);
        let now = jiff::Timestamp::now();

        let m = ms.find_best(&step, now).unwrap();
        m.note_connect_failure(now);
        assert!(m.is_disabled(now));
        assert!(ms.find_best(&step, now).is_none());

        // supported even while disabled: not an unsupported step
        assert!(ms.supports_step(&step));
    }

    #[test]
    fn test_connect_failure_backoff_is_bounded() {
        let m = Machine::parse_line("host x86_64-linux").unwrap();
        let now = jiff::Timestamp::now();

        m.note_connect_failure(now);
        assert_eq!(m.stats.get_disabled_until(), now.as_second() + 60);
        m.note_connect_failure(now);
        assert_eq!(m.stats.get_disabled_until(), now.as_second() + 120);

        for _ in 0..20 {
            m.note_connect_failure(now);
        }
        assert_eq!(
            m.stats.get_disabled_until(),
            now.as_second() + MAX_DISABLE_SECS
        );

        m.stats.track_step_success(0);
        assert_eq!(m.stats.get_consecutive_failures(), 0);
        assert!(!m.is_disabled(now));
    }

    #[test]
    fn test_reservation_accounting() {
        let machine = Arc::new(Machine::parse_line("host x86_64-linux - 2 1.0").unwrap());
        let step = step_for("x86_64-linux", &[]);
        let notify = Arc::new(tokio::sync::Notify::new());

        let r1 = MachineReservation::new(machine.clone(), step.clone(), notify.clone());
        let r2 = MachineReservation::new(machine.clone(), step.clone(), notify.clone());
        assert_eq!(machine.stats.get_current_jobs(), 2);
        assert!(!machine.has_capacity());

        drop(r1);
        assert_eq!(machine.stats.get_current_jobs(), 1);
        drop(r2);
        assert_eq!(machine.stats.get_current_jobs(), 0);
        assert!(machine.stats.get_idle_since() > 0);
        assert_eq!(machine.stats.get_nr_steps_done(), 2);
    }

    #[test]
    fn test_replace_all_preserves_stats() {
        let ms = Machines::new();
        ms.replace_all(Machines::parse_inventory("host x86_64-linux - 4 1.0"));
        let m = ms.get_by_name("host").unwrap();
        for _ in 0..3 {
            m.stats.job_started();
        }

        // reload with a different speed factor, same name
        ms.replace_all(Machines::parse_inventory("host x86_64-linux - 4 2.0"));
        let m2 = ms.get_by_name("host").unwrap();
        assert_eq!(m2.stats.get_current_jobs(), 3);
        assert!((m2.speed_factor - 2.0).abs() < f32::EPSILON);
    }
}
