//! `slamsync` – demo driver for the synchronisation pipeline.
//!
//! Loads `~/.slamsync/config.toml` (or `--config <path>`), then drives a
//! synthetic robot through the pipeline:
//!
//! 1. an odometry source drifting slowly away from the true trajectory,
//!    written into the frame buffer at 20 Hz;
//! 2. laser scans stamped slightly behind odometry, pushed through the
//!    bounded ingress;
//! 3. a toy world model that localizes each scan from the beacon fix
//!    embedded in it, which yields the `map ← odom` correction.
//!
//! Runs until Ctrl-C or `--seconds <n>` elapse, then prints the pipeline
//! counters as JSON.

mod model;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use colored::Colorize;
use slamsync_perception::StampedTransform;
use slamsync_runtime::{Pipeline, PipelineConfig, config, telemetry};
use tracing::{info, warn};

use model::{BeaconLocalizer, LoggingMapSink};

const ODOM_RATE_HZ: f64 = 20.0;
/// Scans are stamped this far behind the newest odometry sample.
const SCAN_LAG_MS: i64 = 25;

struct Args {
    config: Option<PathBuf>,
    seconds: Option<u64>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config: None,
        seconds: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let path = it.next().ok_or("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--seconds" => {
                let raw = it.next().ok_or("--seconds needs a value")?;
                let secs = raw.parse().map_err(|e| format!("--seconds {raw}: {e}"))?;
                args.seconds = Some(secs);
            }
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(args)
}

fn main() {
    let _telemetry = telemetry::init_tracing("slamsync");

    print_banner();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}: {e}", "Usage error".red());
            eprintln!("  usage: slamsync [--config <path>] [--seconds <n>]");
            std::process::exit(2);
        }
    };

    let path = args.config.clone().unwrap_or_else(config::config_path);
    let cfg = match config::load_from(&path) {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => {
            println!("  No config at {}; using defaults.", path.display().to_string().dimmed());
            let mut cfg = PipelineConfig::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {e}", "Config error".red());
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "  Ctrl-C received, shutting down …".yellow().bold());
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {e}", "Failed to start tokio runtime".red());
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cfg, args.seconds, shutdown)) {
        eprintln!("{}: {e}", "Pipeline error".red());
        std::process::exit(1);
    }
}

async fn run(cfg: PipelineConfig, seconds: Option<u64>, shutdown: Arc<AtomicBool>) -> Result<(), String> {
    let localizer = Arc::new(BeaconLocalizer::new());
    let pipeline = Pipeline::build(cfg, localizer, Arc::new(LoggingMapSink))
        .map_err(|e| e.to_string())?;
    let handle = pipeline.start().map_err(|e| e.to_string())?;
    let ingress = handle.ingress().clone();

    println!(
        "  Running ({} correction) – {}\n",
        format!("{:?}", pipeline.config().correction_mode()).to_lowercase().bold(),
        match seconds {
            Some(s) => format!("{s} s"),
            None => "until Ctrl-C".to_string(),
        }
        .dimmed()
    );

    let deadline = seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / ODOM_RATE_HZ));
    let started = Utc::now();
    let mut ticks: u64 = 0;
    let mut scans: u64 = 0;

    while !shutdown.load(Ordering::SeqCst) && deadline.is_none_or(|d| tokio::time::Instant::now() < d) {
        ticker.tick().await;
        ticks += 1;
        let now = Utc::now();
        let elapsed = (now - started).num_milliseconds() as f32 / 1000.0;
        let lag = TimeDelta::milliseconds(SCAN_LAG_MS);

        let odom = model::odometry_at(elapsed);
        if let Err(e) = pipeline.buffer().insert(StampedTransform::new(
            pipeline.config().odom_frame_id.clone(),
            model::LASER_FRAME,
            now,
            odom,
        )) {
            warn!(error = %e, "odometry rejected");
        }

        let scan = model::synthetic_scan(elapsed - SCAN_LAG_MS as f32 / 1000.0);
        match ingress.on_observation(now - lag, model::LASER_FRAME, scan) {
            Ok(()) => scans += 1,
            Err(e) => warn!(error = %e, "scan not accepted"),
        }

        if ticks % (ODOM_RATE_HZ as u64 * 5) == 0 {
            let stats = pipeline.stats();
            info!(
                scans,
                delivered = stats.topic.delivered,
                corrections = stats.correction.published,
                pending = stats.topic.pending,
                "progress"
            );
        }
    }

    pipeline.shutdown();
    drop(ingress);
    handle.join().await;

    let stats = pipeline.stats();
    let json = serde_json::to_string_pretty(&stats).map_err(|e| e.to_string())?;
    println!("\n{}", "  Pipeline statistics".bold().cyan());
    println!("{json}");

    let frames = (&pipeline.config().map_frame_id, &pipeline.config().odom_frame_id);
    if let Some(correction) = pipeline.buffer().latest_sample(frames.0, frames.1) {
        let t = correction.transform;
        println!(
            "\n  Final correction {} ← {}: x={:.3} y={:.3} yaw={:.3}",
            frames.0,
            frames.1,
            t.translation.x,
            t.translation.y,
            t.rotation.yaw()
        );
    }
    Ok(())
}

fn print_banner() {
    println!();
    println!("{}", "  slamsync".bold().cyan());
    println!("  {} {}", "sensor/frame synchronisation demo".dimmed(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!();
}
