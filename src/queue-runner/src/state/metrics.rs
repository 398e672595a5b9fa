use prometheus::Encoder as _;

/// Operator-facing counters. Status reporting only; scheduling correctness
/// never depends on these values.
pub struct Metrics {
    registry: prometheus::Registry,

    pub queue_checks_started: prometheus::IntCounter,
    pub queue_checks_finished: prometheus::IntCounter,
    pub queue_build_loads: prometheus::IntCounter,
    pub queue_steps_created: prometheus::IntCounter,
    pub nr_queue_wakeups: prometheus::IntCounter,

    pub nr_builds_read: prometheus::IntCounter,
    pub nr_builds_done: prometheus::IntCounter,
    pub nr_steps_started: prometheus::IntCounter,
    pub nr_steps_done: prometheus::IntCounter,
    pub nr_steps_building: prometheus::IntGauge,
    pub nr_steps_runnable: prometheus::IntGauge,
    pub nr_steps_waiting: prometheus::IntGauge,
    pub nr_steps_unsupported_aborted: prometheus::IntCounter,
    pub nr_substitutions: prometheus::IntCounter,

    pub nr_retries: prometheus::IntCounter,
    pub max_nr_retries: prometheus::IntGauge,
    pub nr_machine_connect_failures: prometheus::IntCounter,

    pub nr_dispatcher_wakeups: prometheus::IntCounter,
    pub dispatch_time_ms: prometheus::IntCounter,
    pub total_step_time_ms: prometheus::IntCounter,

    pub machines_total: prometheus::IntGauge,
    pub machines_in_use: prometheus::IntGauge,

    pub nr_notifications_sent: prometheus::IntCounter,
    pub nr_logs_compressed: prometheus::IntCounter,
}

macro_rules! int_counter {
    ($registry:expr, $name:literal, $help:literal) => {{
        let c = prometheus::IntCounter::new(concat!("forge_queue_runner_", $name), $help)?;
        $registry.register(Box::new(c.clone()))?;
        c
    }};
}

macro_rules! int_gauge {
    ($registry:expr, $name:literal, $help:literal) => {{
        let g = prometheus::IntGauge::new(concat!("forge_queue_runner_", $name), $help)?;
        $registry.register(Box::new(g.clone()))?;
        g
    }};
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = prometheus::Registry::new();

        Ok(Self {
            queue_checks_started: int_counter!(registry, "queue_checks_started", "queue monitor passes started"),
            queue_checks_finished: int_counter!(registry, "queue_checks_finished", "queue monitor passes finished"),
            queue_build_loads: int_counter!(registry, "queue_build_loads", "builds loaded from the queue"),
            queue_steps_created: int_counter!(registry, "queue_steps_created", "steps created by the graph builder"),
            nr_queue_wakeups: int_counter!(registry, "queue_wakeups", "queue monitor wakeups"),
            nr_builds_read: int_counter!(registry, "builds_read", "builds added to the in-memory map"),
            nr_builds_done: int_counter!(registry, "builds_done", "builds finalized in the database"),
            nr_steps_started: int_counter!(registry, "steps_started", "build steps dispatched to a machine"),
            nr_steps_done: int_counter!(registry, "steps_done", "build steps settled"),
            nr_steps_building: int_gauge!(registry, "steps_building", "build steps currently executing"),
            nr_steps_runnable: int_gauge!(registry, "steps_runnable", "steps in the runnable set"),
            nr_steps_waiting: int_gauge!(registry, "steps_waiting", "runnable steps with no free machine"),
            nr_steps_unsupported_aborted: int_counter!(registry, "steps_unsupported_aborted", "steps aborted for lack of a supporting machine"),
            nr_substitutions: int_counter!(registry, "substitutions", "builds satisfied from already-realized outputs"),
            nr_retries: int_counter!(registry, "step_retries", "step retries after transient failures"),
            max_nr_retries: int_gauge!(registry, "step_max_retries", "highest retry count seen on a step"),
            nr_machine_connect_failures: int_counter!(registry, "machine_connect_failures", "machine connect or handshake failures"),
            nr_dispatcher_wakeups: int_counter!(registry, "dispatcher_wakeups", "dispatcher wakeups"),
            dispatch_time_ms: int_counter!(registry, "dispatch_time_ms", "total time spent in dispatch passes"),
            total_step_time_ms: int_counter!(registry, "step_time_ms", "total wall time of remote steps"),
            machines_total: int_gauge!(registry, "machines_total", "machines in the inventory"),
            machines_in_use: int_gauge!(registry, "machines_in_use", "machines with at least one running job"),
            nr_notifications_sent: int_counter!(registry, "notifications_sent", "build notifications delivered"),
            nr_logs_compressed: int_counter!(registry, "logs_compressed", "build logs compressed"),
            registry,
        })
    }

    /// Text exposition of all registered metrics.
    pub fn gather(&self) -> anyhow::Result<String> {
        let mut buffer = vec![];
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_gather() {
        let metrics = Metrics::new().unwrap();
        metrics.nr_retries.inc();
        metrics.nr_steps_building.set(3);

        let text = metrics.gather().unwrap();
        assert!(text.contains("forge_queue_runner_step_retries 1"));
        assert!(text.contains("forge_queue_runner_steps_building 3"));
    }
}
