// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DRAY worker executable.
//!
//! Connects to the coordinator, waits for its treelet assignment, and runs
//! the event loop until told to stop.
//!
//! # Usage
//!
//! ```bash
//! # Minimal: coordinator endpoint plus a storage backend
//! dray-worker --ip 10.0.0.1 --port 50000 --storage-backend file:///scenes/sibenik
//!
//! # Reliable ray transport at 200 Mbps, sampling 1% of packets into the log
//! dray-worker --ip 10.0.0.1 --port 50000 --storage-backend file:///scenes/sibenik \
//!     --reliable-udp --max-udp-rate 200 --log-packets 0.01
//! ```

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;

use dray::config::DEFAULT_MAX_UDP_RATE_MBPS;
use dray::storage::create_backend;
use dray::tracer::NullTracer;
use dray::{FinishedRayAction, Worker, WorkerConfig};

/// DRAY distributed ray-tracing worker
#[derive(Parser, Debug)]
#[command(name = "dray-worker")]
#[command(about = "DRAY distributed ray-tracing worker", version)]
struct Args {
    /// IP address of the coordinator
    #[arg(short, long)]
    ip: IpAddr,

    /// Port of the coordinator
    #[arg(short, long, default_value = "50000")]
    port: u16,

    /// Storage backend URI (e.g. file:///scenes/sibenik)
    #[arg(short = 's', long)]
    storage_backend: String,

    /// Send ray packets reliably
    #[arg(short = 'R', long)]
    reliable_udp: bool,

    /// Maximum UDP rate in Mbps
    #[arg(short = 'M', long, default_value_t = DEFAULT_MAX_UDP_RATE_MBPS)]
    max_udp_rate: u64,

    /// Samples per pixel (0 = scene default)
    #[arg(short = 'S', long, default_value = "0")]
    samples: u32,

    /// Fraction of rays to trace in the action log [0, 1]
    #[arg(short = 'L', long, default_value = "0.0")]
    log_rays: f64,

    /// Fraction of packets to trace in the packet log [0, 1]
    #[arg(short = 'P', long, default_value = "0.0")]
    log_packets: f64,

    /// What to do with finished rays: 0=discard, 1=send, 2=upload
    #[arg(short = 'f', long, default_value = "0")]
    finished_ray: u8,
}

fn run(args: &Args) -> dray::Result<()> {
    let config = WorkerConfig {
        send_reliably: args.reliable_udp,
        max_udp_rate_mbps: args.max_udp_rate,
        samples_per_pixel: args.samples,
        finished_ray_action: FinishedRayAction::from_cli(args.finished_ray).ok_or_else(|| {
            dray::Error::Config(format!("invalid finished-ray action {}", args.finished_ray))
        })?,
        ray_log_rate: args.log_rays,
        packet_log_rate: args.log_packets,
    };
    if args.port == 0 {
        return Err(dray::Error::Config("coordinator port must be non-zero".into()));
    }
    if !config.validate() {
        return Err(dray::Error::Config(
            "log rates must be within [0, 1] and the UDP rate non-zero".into(),
        ));
    }

    let storage = create_backend(&args.storage_backend)?;
    let coordinator = SocketAddr::new(args.ip, args.port);

    let mut worker = Worker::new(coordinator, storage, Box::new(NullTracer), config)?;
    let outcome = worker.run();
    worker.upload_logs();
    outcome
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("dray-worker: {}", err);
            eprintln!("dray-worker: {}", err);
            ExitCode::FAILURE
        }
    }
}
