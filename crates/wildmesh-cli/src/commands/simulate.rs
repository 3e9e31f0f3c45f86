use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use wildmesh_config::WildmeshConfig;
use wildmesh_core::{Destination, MeshError, Millis, NodeId, Priority, TaskType};
use wildmesh_mesh::{MeshSimulation, SimulationReport, TaskRequest};

#[derive(Args, Debug, Clone)]
pub(super) struct SimulateArgs {
    /// Number of nodes on the radio (ids 1..=N)
    #[arg(short, long, default_value_t = 5)]
    pub(super) nodes: u32,

    /// Simulated run time in seconds
    #[arg(short, long, default_value_t = 600)]
    pub(super) duration: u64,

    /// Frame loss probability, overrides simulation.loss_rate
    #[arg(long)]
    pub(super) loss: Option<f64>,

    /// Radio seed, overrides simulation.seed
    #[arg(long)]
    pub(super) seed: Option<u64>,

    /// Tasks the coordinator hands out over the run
    #[arg(short, long, default_value_t = 10)]
    pub(super) tasks: u32,

    /// Telemetry payload each follower sends the coordinator, in bytes (0 = none)
    #[arg(long, default_value_t = 0)]
    pub(super) payload_size: usize,

    /// Take this node off the air halfway through the run
    #[arg(long)]
    pub(super) fail_node: Option<u32>,

    /// Step on a wall-clock interval instead of as fast as possible
    #[arg(long)]
    pub(super) realtime: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub(super) json: bool,
}

/// Task types handed out in turn.
const ROTATION: [TaskType; 4] = [
    TaskType::ImageCapture,
    TaskType::SensorReading,
    TaskType::SpeciesDetection,
    TaskType::VideoCapture,
];

/// Scripted load applied between simulation steps.
struct Workload {
    tasks_left: u32,
    task_interval: Millis,
    next_task_at: Option<Millis>,
    issued: usize,
    refused: usize,
    payload_size: usize,
    payloads_sent: bool,
    failure: Option<(NodeId, Millis)>,
}

impl Workload {
    fn new(args: &SimulateArgs, duration_ms: Millis) -> Self {
        Self {
            tasks_left: args.tasks,
            // Leave the first half of the run to the election.
            task_interval: (duration_ms / 2) / u64::from(args.tasks.max(1)),
            next_task_at: None,
            issued: 0,
            refused: 0,
            payload_size: args.payload_size,
            payloads_sent: false,
            failure: args.fail_node.map(|n| (NodeId::new(n), duration_ms / 2)),
        }
    }

    fn apply(&mut self, sim: &mut MeshSimulation) {
        let now = sim.now();

        if let Some((node, at)) = self.failure
            && now >= at
        {
            warn!(node = %node, at = now, "taking node off the air");
            sim.set_online(node, false);
            self.failure = None;
        }

        let Some(coordinator) = sim.coordinators().first().copied() else {
            return;
        };

        if !self.payloads_sent && self.payload_size > 0 {
            self.payloads_sent = true;
            let payload: Vec<u8> = (0..self.payload_size).map(|i| (i % 251) as u8).collect();
            for node in sim.node_ids() {
                if node == coordinator {
                    continue;
                }
                if let Some(agent) = sim.agent_mut(node)
                    && let Err(e) = agent.send_payload(
                        Destination::Node(coordinator),
                        &payload,
                        Priority::Low,
                        now,
                    )
                {
                    warn!(node = %node, code = e.code(), "payload not queued: {e}");
                }
            }
        }

        if self.tasks_left == 0 {
            return;
        }
        let due = *self.next_task_at.get_or_insert(now);
        if now < due {
            return;
        }
        self.next_task_at = Some(now.saturating_add(self.task_interval));
        self.tasks_left -= 1;

        let task_type = ROTATION[self.issued % ROTATION.len()];
        self.issued += 1;
        let Some(agent) = sim.agent_mut(coordinator) else {
            return;
        };
        match agent.assign_task(TaskRequest::new(task_type), now) {
            Ok(task_id) => debug!(task_id, %task_type, "scripted task issued"),
            Err(e) => {
                self.refused += 1;
                warn!(%task_type, code = e.code(), "scripted task not assigned: {e}");
            }
        }
    }
}

#[derive(Serialize)]
struct RunSummary {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    seed: u64,
    loss_rate: f64,
    tasks_issued: usize,
    tasks_unassignable: usize,
    report: SimulationReport,
}

pub(super) async fn cmd_simulate(
    mut config: WildmeshConfig,
    args: SimulateArgs,
) -> wildmesh_core::Result<()> {
    if args.nodes == 0 {
        return Err(MeshError::Config("--nodes must be at least 1".into()));
    }
    if let Some(loss) = args.loss {
        if !(0.0..=1.0).contains(&loss) {
            return Err(MeshError::Config(format!("--loss {loss} is outside 0.0..=1.0")));
        }
        config.simulation.loss_rate = loss;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }

    let duration_ms = args.duration.saturating_mul(1_000);
    let mut sim = MeshSimulation::uniform(&config, args.nodes)?;
    let mut workload = Workload::new(&args, duration_ms);
    let started_at = Utc::now();

    info!(
        nodes = args.nodes,
        duration_s = args.duration,
        tasks = args.tasks,
        realtime = args.realtime,
        "simulation starting"
    );

    if args.realtime {
        let mut interval = tokio::time::interval(Duration::from_millis(sim.tick_ms()));
        while sim.now() < duration_ms {
            tokio::select! {
                _ = interval.tick() => {
                    workload.apply(&mut sim);
                    for e in sim.step() {
                        info!(at = e.at, node = %e.node, event = ?e.event, "mesh event");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!(at = sim.now(), "interrupted, reporting partial run");
                    break;
                }
            }
        }
    } else {
        while sim.now() < duration_ms {
            workload.apply(&mut sim);
            for e in sim.step() {
                debug!(at = e.at, node = %e.node, event = ?e.event, "mesh event");
            }
        }
    }

    let summary = RunSummary {
        started_at,
        finished_at: Utc::now(),
        seed: config.simulation.seed,
        loss_rate: config.simulation.loss_rate,
        tasks_issued: workload.issued,
        tasks_unassignable: workload.refused,
        report: sim.report(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let report = &summary.report;
    let coordinators: Vec<String> = report.coordinators.iter().map(|c| c.to_string()).collect();

    println!("wildmesh simulation");
    println!(
        "   Run:          {} ({} ms simulated, wall {} ms)",
        summary.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        report.duration_ms,
        (summary.finished_at - summary.started_at).num_milliseconds()
    );
    println!(
        "   Radio:        seed {}, loss {:.1}%",
        summary.seed,
        summary.loss_rate * 100.0
    );
    println!("   Nodes:        {}", report.nodes);
    println!(
        "   Coordinator:  {}",
        if coordinators.is_empty() {
            "none".to_string()
        } else {
            coordinators.join(", ")
        }
    );
    println!(
        "   Tasks:        {} issued, {} unassignable, {} completed, {} failed, {} reassigned",
        summary.tasks_issued,
        summary.tasks_unassignable,
        report.tasks_completed,
        report.tasks_failed,
        report.tasks_reassigned
    );
    println!("   Payloads:     {} delivered", report.payloads_delivered);
    println!(
        "   Frames:       {} delivered, {} dropped",
        report.frames_delivered, report.frames_dropped
    );
    println!();
    for status in &report.statuses {
        print!("{status}");
    }
}
