// Synthetic load simulation
//
// Each submitted task carries its own plan (work time, whether its first
// attempt crashes the worker or fails), drawn from a seeded RNG so runs are
// reproducible.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relaykit_dispatch::{
    AdmissionMode, DispatchEngine, EngineConfig, EngineStats, SchedulingPolicy, TaskContext,
    TaskError, TaskSpec, TaskStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

use crate::output::{print_field, print_section, print_table_header, print_table_row, OutputFormat};

const SYNTHETIC_KIND: &str = "synthetic";

#[derive(Args)]
pub struct SimulateArgs {
    /// Number of tasks to submit
    #[arg(long, short = 'n', default_value = "200")]
    pub tasks: u64,

    /// Override the minimum pool size
    #[arg(long)]
    pub min_workers: Option<usize>,

    /// Override the maximum pool size
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Scheduling policy (priority, fair-share, wrr, deadline, work-stealing)
    #[arg(long)]
    pub policy: Option<SchedulingPolicy>,

    /// Shortest simulated work per task, in milliseconds
    #[arg(long, default_value = "5")]
    pub min_work_ms: u64,

    /// Longest simulated work per task, in milliseconds
    #[arg(long, default_value = "50")]
    pub max_work_ms: u64,

    /// Probability that a task's first attempt crashes its worker
    #[arg(long, default_value = "0.0")]
    pub crash_rate: f64,

    /// Probability that a task's first attempt fails with a retryable error
    #[arg(long, default_value = "0.0")]
    pub fail_rate: f64,

    /// Attempt budget per task (engine default when omitted)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Distinct priorities assigned at random
    #[arg(long, default_value = "1")]
    pub priority_levels: u32,

    /// Share keys tasks are spread across (fair-share)
    #[arg(long, default_value = "1")]
    pub tenants: u64,

    /// Soft deadline per task, in milliseconds from submission
    #[arg(long)]
    pub deadline_ms: Option<u64>,

    /// Outstanding task limit for admission control
    #[arg(long)]
    pub max_outstanding: Option<usize>,

    /// Wait this long for capacity instead of rejecting, in milliseconds
    #[arg(long)]
    pub admission_wait_ms: Option<u64>,

    /// Pause between submissions, in milliseconds
    #[arg(long, default_value = "0")]
    pub submit_interval_ms: u64,

    /// RNG seed for task plans
    #[arg(long, default_value = "42")]
    pub seed: u64,
}

impl SimulateArgs {
    fn validate(&self) -> Result<()> {
        ensure!(self.tasks > 0, "--tasks must be at least 1");
        ensure!(
            (0.0..=1.0).contains(&self.crash_rate),
            "--crash-rate must be between 0 and 1"
        );
        ensure!(
            (0.0..=1.0).contains(&self.fail_rate),
            "--fail-rate must be between 0 and 1"
        );
        ensure!(
            self.min_work_ms <= self.max_work_ms,
            "--min-work-ms must not exceed --max-work-ms"
        );
        Ok(())
    }

    fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(min) = self.min_workers {
            config.pool.min_workers = min;
        }
        if let Some(max) = self.max_workers {
            config.pool.max_workers = max;
        }
        if let Some(policy) = &self.policy {
            config.scheduling = policy.clone();
        }
        if let Some(limit) = self.max_outstanding {
            config.backpressure.max_outstanding = Some(limit);
        }
        if let Some(wait) = self.admission_wait_ms {
            config.backpressure.admission = AdmissionMode::Wait {
                timeout: Duration::from_millis(wait),
            };
        }
        config
    }

    fn plan(&self, n: u64, rng: &mut StdRng) -> TaskSpec {
        let plan = WorkPlan {
            n,
            work_ms: rng.gen_range(self.min_work_ms..=self.max_work_ms),
            crash_first_attempt: rng.gen_bool(self.crash_rate),
            fail_first_attempt: rng.gen_bool(self.fail_rate),
        };
        let priority = rng.gen_range(0..self.priority_levels.max(1));

        let mut spec = TaskSpec::new(SYNTHETIC_KIND, json!(plan))
            .with_priority(i64::from(priority))
            .with_share_key(format!("tenant-{}", n % self.tenants.max(1)));
        if let Some(max_attempts) = self.max_attempts {
            spec = spec.with_max_attempts(max_attempts);
        }
        if let Some(deadline) = self.deadline_ms {
            spec = spec.with_deadline_in(Duration::from_millis(deadline));
        }
        spec
    }
}

/// What one synthetic task does
#[derive(Debug, Serialize, Deserialize)]
struct WorkPlan {
    n: u64,
    work_ms: u64,
    crash_first_attempt: bool,
    fail_first_attempt: bool,
}

async fn synthetic_body(ctx: TaskContext, input: Value) -> Result<Value, TaskError> {
    let plan: WorkPlan = serde_json::from_value(input)?;
    if plan.crash_first_attempt && ctx.attempt == 1 {
        panic!("simulated worker crash on task {}", plan.n);
    }
    ctx.ack().await?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(plan.work_ms)) => {}
        _ = ctx.cancelled() => return Err(TaskError::non_retryable("recalled")),
    }

    if plan.fail_first_attempt && ctx.attempt == 1 {
        return Err(TaskError::retryable("simulated transient failure"));
    }
    Ok(json!({ "n": plan.n, "attempt": ctx.attempt, "worker": ctx.worker_id }))
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    tasks: u64,
    accepted: u64,
    rejected: u64,
    policy: String,
    elapsed_ms: u128,
    throughput_per_sec: f64,
    outcomes: BTreeMap<String, u64>,
    mean_attempts: f64,
    late: u64,
    out_of_order: u64,
    events: BTreeMap<String, u64>,
    stats: EngineStats,
}

pub async fn run(
    args: SimulateArgs,
    config: EngineConfig,
    output: OutputFormat,
    quiet: bool,
) -> Result<()> {
    args.validate()?;
    let config = args.apply(config);
    let policy = config.scheduling.to_string();

    let engine = DispatchEngine::new(config).context("Invalid engine configuration")?;
    engine.register_handler(SYNTHETIC_KIND, synthetic_body);

    let (stop_events, stopped) = oneshot::channel();
    let event_counter = tokio::spawn(count_events(engine.subscribe_events(), stopped));
    let mut deliveries = engine.subscribe_results();

    engine.start().await?;
    if !quiet {
        tracing::info!(tasks = args.tasks, %policy, "Starting simulation");
    }

    let started = Instant::now();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut handles = Vec::with_capacity(args.tasks as usize);
    let mut rejected = 0u64;

    for n in 0..args.tasks {
        match engine.submit(args.plan(n, &mut rng)).await {
            Ok(handle) => handles.push(handle),
            Err(e) if e.is_rejected() => rejected += 1,
            Err(e) => return Err(e).context("Submission failed"),
        }
        if args.submit_interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.submit_interval_ms)).await;
        }
    }

    let accepted = handles.len() as u64;
    let mut outcomes: BTreeMap<String, u64> = BTreeMap::new();
    let mut attempts = 0u64;
    let mut late = 0u64;
    for handle in handles {
        let result = handle.result().await?;
        *outcomes.entry(result.status.to_string()).or_default() += 1;
        attempts += u64::from(result.attempts);
        if result.late {
            late += 1;
        }
    }
    let elapsed = started.elapsed();

    let mut out_of_order = 0u64;
    loop {
        match deliveries.try_recv() {
            Ok(delivery) if delivery.out_of_order => out_of_order += 1,
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    let stats = engine.stats().await?;
    engine.shutdown().await?;
    let _ = stop_events.send(());
    let events = event_counter.await.context("Event counter failed")?;

    let report = SimulationReport {
        tasks: args.tasks,
        accepted,
        rejected,
        policy,
        elapsed_ms: elapsed.as_millis(),
        throughput_per_sec: accepted as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        outcomes,
        mean_attempts: if accepted == 0 {
            0.0
        } else {
            attempts as f64 / accepted as f64
        },
        late,
        out_of_order,
        events,
        stats,
    };

    if output.is_text() {
        print_report(&report);
        Ok(())
    } else {
        output.print_value(&report)
    }
}

/// Count engine events by name until told to stop
async fn count_events(
    mut events: broadcast::Receiver<relaykit_dispatch::EngineEvent>,
    mut stop: oneshot::Receiver<()>,
) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Ok(event) => *counts.entry(event.name().to_string()).or_default() += 1,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event counter lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    // Whatever arrived before the stop signal
    while let Ok(event) = events.try_recv() {
        *counts.entry(event.name().to_string()).or_default() += 1;
    }
    counts
}

fn print_report(report: &SimulationReport) {
    print_field("Policy", &report.policy);
    print_field(
        "Tasks",
        &format!(
            "{} submitted, {} accepted, {} rejected",
            report.tasks, report.accepted, report.rejected
        ),
    );
    print_field("Elapsed", &format!("{}ms", report.elapsed_ms));
    print_field("Throughput", &format!("{:.1} tasks/s", report.throughput_per_sec));
    print_field("Mean attempts", &format!("{:.2}", report.mean_attempts));
    print_field("Late", &report.late.to_string());
    print_field("Out of order", &report.out_of_order.to_string());
    print_field("Retried", &report.stats.retried().to_string());
    print_field("Duplicates", &report.stats.protocol.duplicates.to_string());
    print_field("Speculated", &report.stats.protocol.speculated.to_string());
    print_field("Affinity hits", &report.stats.scheduler.affinity_hits.to_string());
    print_field("Admission load", &format!("{:.2}", report.stats.admission_load));
    print_field("Dedup entries", &report.stats.dedup_entries.to_string());

    print_section("Outcomes");
    print_table_header(&[("STATUS", 12), ("COUNT", 8)]);
    for status in [
        TaskStatus::Success,
        TaskStatus::Failure,
        TaskStatus::Timeout,
        TaskStatus::Cancelled,
    ] {
        let status = status.to_string();
        let count = report.outcomes.get(&status).copied().unwrap_or(0).to_string();
        print_table_row(&[(&status, 12), (&count, 8)]);
    }

    if !report.events.is_empty() {
        print_section("Events");
        print_table_header(&[("EVENT", 22), ("COUNT", 8)]);
        for (name, count) in &report.events {
            print_table_row(&[(name, 22), (&count.to_string(), 8)]);
        }
    }

    print_section("Workers");
    print_table_header(&[("STATE", 14), ("COUNT", 8)]);
    for (state, count) in &report.stats.workers {
        print_table_row(&[(&state.to_string(), 14), (&count.to_string(), 8)]);
    }
}
