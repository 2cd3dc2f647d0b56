//! Two scheduler nodes sharing one in-memory store.
//!
//! 時刻はシミュレーションで進めます。`--crash-after` を指定すると node-a は
//! 取得したトリガーを抱えたまま止まり、node-b がそれを回収します。

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DurationRound, TimeDelta, Utc};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use treadle_core::domain::{CompletedExecutionInstruction, JobDetail, JobKey, Schedule, TriggerKey, TriggerRecord};
use treadle_core::impls::InMemoryStore;
use treadle_core::ports::{Clock, FixedClock, Store};
use treadle_core::typed::JobKind;
use treadle_core::{JobStore, JobStoreBuilder, StoreConfig, TriggerFiredResult};

#[derive(Debug, Parser)]
#[command(name = "treadle", about = "Simulate a clustered job store")]
struct Args {
    /// Number of jobs, each with one repeating trigger.
    #[arg(long, default_value_t = 4)]
    jobs: usize,

    /// Simulated rounds; each advances the clock by one interval.
    #[arg(long, default_value_t = 6)]
    rounds: usize,

    /// Repeat interval of the triggers, in seconds.
    #[arg(long, default_value_t = 10)]
    interval_secs: u64,

    /// node-a stops after acquiring in this round, without completing.
    #[arg(long)]
    crash_after: Option<usize>,

    /// Check-in interval in milliseconds.
    #[arg(long, default_value_t = 7_500)]
    checkin_interval_ms: u64,

    /// Trigger lease timeout in seconds.
    #[arg(long, default_value_t = 600)]
    trigger_timeout_secs: u64,
}

struct DemoReport;

impl JobKind for DemoReport {
    const TYPE: &'static str = "demo.report.v1";
}

fn build_node(
    args: &Args,
    store: Arc<dyn Store>,
    clock: Arc<FixedClock>,
    instance_id: &str,
) -> Result<JobStore, Box<dyn Error>> {
    let config = StoreConfig::new(instance_id)
        .with_clustered(true)
        .with_checkin_interval(Duration::from_millis(args.checkin_interval_ms))
        .with_trigger_timeout(Duration::from_secs(args.trigger_timeout_secs));
    let job_store = JobStoreBuilder::new(config)
        .store(store)
        .clock(clock)
        .register_job_type::<DemoReport>()?
        .expect_job_types(&[DemoReport::TYPE])
        .build()?;
    Ok(job_store)
}

/// Acquire, fire and complete everything due on one node; returns the fired count.
async fn run_round(node: &JobStore, clock: &FixedClock) -> Result<usize, Box<dyn Error>> {
    let acquired = node.acquire_next_triggers(clock.now(), 16, Duration::ZERO).await?;
    let mut fired = 0;
    for result in node.triggers_fired(&acquired).await {
        match result {
            TriggerFiredResult::Fired(bundle) => {
                info!(
                    node = node.instance_id(),
                    trigger = %bundle.trigger.key,
                    job = %bundle.job.key(),
                    recovering = bundle.recovering,
                    "job executed"
                );
                node.triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
                    .await?;
                fired += 1;
            }
            TriggerFiredResult::Skipped => {}
            TriggerFiredResult::Failed(err) => warn!(node = node.instance_id(), error = %err, "fire failed"),
        }
    }
    Ok(fired)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let start = Utc::now().duration_trunc(TimeDelta::seconds(1))?;
    let clock = Arc::new(FixedClock::new(start));
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let node_a = build_node(&args, store.clone(), clock.clone(), "node-a")?;
    let node_b = build_node(&args, store, clock.clone(), "node-b")?;
    node_a.start().await?;
    node_b.start().await?;

    let interval = Duration::from_secs(args.interval_secs);
    for i in 0..args.jobs {
        let job = JobDetail::new(JobKey::new(format!("report-{i}"), "demo"), DemoReport::TYPE)
            .requests_recovery(true)
            .with_data("index", i as u64);
        let trigger = TriggerRecord::new(
            TriggerKey::new(format!("every-{}s-{i}", args.interval_secs), "demo"),
            job.key.clone(),
            Schedule::repeat_forever(interval),
            start + TimeDelta::seconds(1),
        );
        node_a.store_job_and_trigger(job, trigger).await?;
    }

    let mut a_alive = true;
    let mut total = 0;
    for round in 0..args.rounds {
        clock.advance(interval);
        if a_alive {
            node_a.check_in().await?;
        }
        node_b.check_in().await?;
        if a_alive {
            if args.crash_after == Some(round) {
                let held = node_a.acquire_next_triggers(clock.now(), 16, Duration::ZERO).await?;
                warn!(round, held = held.len(), "node-a crashed while holding triggers");
                a_alive = false;
            } else {
                total += run_round(&node_a, &clock).await?;
            }
        }
        total += run_round(&node_b, &clock).await?;

        let report = node_b.recover_now().await?;
        if !report.is_empty() {
            info!(round, ?report, "node-b recovered");
        }
    }

    info!(
        executions = total,
        jobs = node_b.number_of_jobs().await?,
        triggers = node_b.number_of_triggers().await?,
        "simulation finished"
    );
    if a_alive {
        node_a.shutdown().await?;
    }
    node_b.shutdown().await?;
    Ok(())
}
