//! `arbord`: a single-process arbor tree.
//!
//! Runs one coordinator per rank of a k-ary overlay inside this process,
//! wires them with the in-process transport, and submits one job whose
//! lifecycle streams to the log. Exists to exercise the whole stack —
//! coordination protocol, hello fan-out, and real job-shell processes —
//! from one binary.

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arbor_coord::executor::process::ProcessExecutor;
use arbor_coord::{topic, Coordinator};
use arbor_overlay::{Topology, TreeNet};
use arbor_rankset::RankSet;

mod config;

use config::ArbordConfig;

#[derive(Debug, Parser)]
#[command(name = "arbord", about = "Run an in-process arbor tree and submit one job")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of ranks (overrides the config).
    #[arg(long)]
    size: Option<u32>,

    /// Tree fan-out (overrides the config).
    #[arg(long)]
    fanout: Option<u32>,

    /// Job-shell program (overrides the config).
    #[arg(long)]
    job_shell: Option<PathBuf>,

    /// Id of the submitted job.
    #[arg(long, default_value_t = 1)]
    id: i64,

    /// Userid recorded for the job.
    #[arg(long, default_value_t = 0)]
    userid: u32,

    /// Ranks hosting the job, in comma-and-range form. Defaults to every
    /// rank.
    #[arg(long)]
    ranks: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => toml::from_str::<ArbordConfig>(&std::fs::read_to_string(path)?)?,
        None => ArbordConfig::default(),
    };
    if let Some(size) = args.size {
        config.overlay.size = size;
    }
    if let Some(fanout) = args.fanout {
        config.overlay.fanout = fanout;
    }
    if let Some(job_shell) = &args.job_shell {
        config.exec.job_shell = job_shell.clone();
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.tracing.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let topology = Topology::kary(config.overlay.size, config.overlay.fanout);
    let target: RankSet = match &args.ranks {
        Some(ranks) => ranks.parse()?,
        None => topology.ranks(),
    };

    info!(
        size = config.overlay.size,
        fanout = config.overlay.fanout,
        job = args.id,
        targets = %target,
        "starting tree"
    );

    let mut net = TreeNet::new(topology.clone());
    let mut coordinators = Vec::new();
    for rank in topology.ranks().iter() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let executor = ProcessExecutor::new(events_tx);
        let coordinator = Coordinator::new(
            net.overlay(rank),
            executor,
            events_rx,
            config.exec.coordinator_config(),
        );
        coordinators.push(tokio::spawn(coordinator.run()));
    }

    let client = net.client(0);
    let mut replies = client.request(
        topic::START,
        json!({ "id": args.id, "userid": args.userid, "ranks": target }),
    )?;

    let mut status = 1;
    loop {
        tokio::select! {
            reply = replies.recv() => match reply {
                Some(Ok(payload)) => match payload["type"].as_str() {
                    Some("start") => info!(job = args.id, "job started on every rank"),
                    Some("finish") => {
                        status = payload["data"]["status"].as_i64().unwrap_or(1) as i32;
                        info!(job = args.id, status, "job finished");
                        break;
                    }
                    Some("exception") => {
                        warn!(
                            job = args.id,
                            severity = %payload["data"]["severity"],
                            note = %payload["data"]["note"],
                            "job exception"
                        );
                    }
                    _ => warn!(%payload, "unexpected reply"),
                },
                Some(Err(error)) => {
                    error!(%error, "job failed");
                    break;
                }
                None => {
                    error!("coordinator went away");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                warn!(job = args.id, "interrupted, killing job");
                client.send(
                    topic::KILL,
                    json!({ "id": args.id, "signal": 15, "ranks": target }),
                )?;
            }
        }
    }

    std::process::exit(status);
}
