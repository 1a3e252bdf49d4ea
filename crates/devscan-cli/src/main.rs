mod sim;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use devscan_capture::angle::AngleConfig;
use devscan_capture::camera::{CameraConfig, ShellCamera};
use devscan_capture::crop::JpegCropper;
use devscan_capture::{Camera, QueueSink, ScanMode, SessionConfig, TrackerSession};
use devscan_proto::CaptureSet;
use devscan_vision::{OverlapPolicy, TrackerConfig};

#[derive(Debug, Parser)]
#[command(name = "devscan", version, about = "devscan - object tracking & capture coordination for device scanning")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate configuration ranges.
    Doctor,
    /// Run a scan session (simulated scene unless --camera).
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        duration_s: Option<u64>,
        /// Override the configured session mode: scan | manual | auto.
        #[arg(long)]
        mode: Option<String>,
        /// Grab frames through the [camera] hardware instead of the sim.
        #[arg(long)]
        camera: bool,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    session: SessionCfg,
    tracking: TrackingCfg,
    overlap: OverlapCfg,
    angle: AngleConfig,

    camera: Option<CameraConfig>,
    sim: Option<sim::SimConfig>,
}

#[derive(Debug, serde::Deserialize)]
struct SessionCfg {
    mode: ScanMode,
    detect_period_ms: u64,
    auto_capture_period_ms: u64,
    drain_poll_ms: u64,
    drain_poll_max: u32,
}

#[derive(Debug, serde::Deserialize)]
struct TrackingCfg {
    iou_match_threshold: f32,
    /// Per-mode default applies when unset (scan 5, manual 10, auto 30).
    max_missed_frames: Option<u32>,
    prune: bool,
}

#[derive(Debug, serde::Deserialize)]
struct OverlapCfg {
    nms_iou_threshold: f32,
    nms_containment_threshold: f32,
    prune_iou_threshold: f32,
    prune_containment_threshold: f32,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

fn parse_mode(s: &str) -> Result<ScanMode> {
    match s {
        "scan" => Ok(ScanMode::Scan),
        "manual" => Ok(ScanMode::Manual),
        "auto" => Ok(ScanMode::Auto),
        other => anyhow::bail!("unknown mode: {} (expected scan|manual|auto)", other),
    }
}

fn real_camera(cfg: &Config) -> Result<ShellCamera> {
    let cam = cfg
        .camera
        .clone()
        .context("--camera requires a [camera] section in the config")?;
    Ok(ShellCamera::new(cam))
}

fn build_session_config(cfg: &Config, mode: ScanMode) -> SessionConfig {
    let defaults = SessionConfig::for_mode(mode);
    SessionConfig {
        mode,
        detect_period_ms: cfg.session.detect_period_ms,
        auto_capture_period_ms: cfg.session.auto_capture_period_ms,
        drain_poll_ms: cfg.session.drain_poll_ms,
        drain_poll_max: cfg.session.drain_poll_max,
        nms: OverlapPolicy {
            iou_threshold: cfg.overlap.nms_iou_threshold,
            containment_threshold: cfg.overlap.nms_containment_threshold,
        },
        tracker: TrackerConfig {
            iou_match_threshold: cfg.tracking.iou_match_threshold,
            max_missed_frames: cfg
                .tracking
                .max_missed_frames
                .unwrap_or(defaults.tracker.max_missed_frames),
            prune: cfg.tracking.prune.then_some(OverlapPolicy {
                iou_threshold: cfg.overlap.prune_iou_threshold,
                containment_threshold: cfg.overlap.prune_containment_threshold,
            }),
        },
        angle: cfg.angle.clone(),
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    let unit = |v: f32| v > 0.0 && v < 1.0;
    anyhow::ensure!(unit(cfg.tracking.iou_match_threshold), "tracking.iou_match_threshold out of (0,1)");
    anyhow::ensure!(unit(cfg.overlap.nms_iou_threshold), "overlap.nms_iou_threshold out of (0,1)");
    anyhow::ensure!(unit(cfg.overlap.nms_containment_threshold), "overlap.nms_containment_threshold out of (0,1)");
    anyhow::ensure!(unit(cfg.overlap.prune_iou_threshold), "overlap.prune_iou_threshold out of (0,1)");
    anyhow::ensure!(unit(cfg.overlap.prune_containment_threshold), "overlap.prune_containment_threshold out of (0,1)");
    anyhow::ensure!(unit(cfg.angle.diversity_iou), "angle.diversity_iou out of (0,1)");

    anyhow::ensure!(
        (100..=10_000).contains(&cfg.session.detect_period_ms),
        "session.detect_period_ms should be 100..10000"
    );
    anyhow::ensure!(
        cfg.session.auto_capture_period_ms >= cfg.session.detect_period_ms,
        "session.auto_capture_period_ms shorter than the detection period"
    );
    anyhow::ensure!(cfg.session.drain_poll_ms >= 10, "session.drain_poll_ms too small");
    anyhow::ensure!(cfg.session.drain_poll_max >= 1, "session.drain_poll_max must be at least 1");

    anyhow::ensure!(
        (1..=10).contains(&cfg.angle.target_count),
        "angle.target_count should be 1..10"
    );
    anyhow::ensure!(cfg.angle.crop_padding_ratio >= 0.0, "angle.crop_padding_ratio negative");

    if let Some(t) = cfg.tracking.max_missed_frames {
        anyhow::ensure!(t <= 120, "tracking.max_missed_frames unreasonably large");
    }

    if let Some(cam) = &cfg.camera {
        anyhow::ensure!(
            matches!(cam.mode.as_str(), "libcamera-jpeg" | "v4l2-mjpeg"),
            "unknown camera.mode: {}",
            cam.mode
        );
        anyhow::ensure!(cam.detect_width > 0 && cam.detect_height > 0, "camera detect geometry invalid");
        anyhow::ensure!(
            cam.full_width >= cam.detect_width && cam.full_height >= cam.detect_height,
            "camera full-res geometry smaller than detection geometry"
        );
    }

    if let Some(s) = &cfg.sim {
        anyhow::ensure!(s.objects >= 1, "sim.objects must be at least 1");
        anyhow::ensure!((0.0..1.0).contains(&s.miss_rate), "sim.miss_rate out of [0,1)");
    }

    info!("doctor: OK");
    Ok(())
}

struct LogSink;

impl QueueSink for LogSink {
    fn submit(&self, set: CaptureSet) {
        info!(
            "capture set queued: label={} conf={:.2} images={}",
            set.label,
            set.confidence,
            set.images.len()
        );
    }
}

async fn run(
    cfg: &Config,
    duration_s: Option<u64>,
    mode_flag: Option<&str>,
    use_camera: bool,
) -> Result<()> {
    let mode = match mode_flag {
        Some(m) => parse_mode(m)?,
        None => cfg.session.mode,
    };
    let scfg = build_session_config(cfg, mode);
    info!("run: starting (mode {:?})", mode);

    let scene = Rc::new(RefCell::new(sim::Scene::new(
        cfg.sim.clone().unwrap_or_default(),
    )));
    // Detections always come from the simulated scene; a real detector
    // backend is the next seam to fill behind the Detector trait.
    let detector = sim::SimDetector::new(scene.clone());
    if use_camera {
        drive(scfg, real_camera(cfg)?, detector, duration_s).await
    } else {
        drive(scfg, sim::SimCamera::new(scene), detector, duration_s).await
    }
}

async fn drive<C: Camera + 'static>(
    scfg: SessionConfig,
    camera: C,
    detector: sim::SimDetector,
    duration_s: Option<u64>,
) -> Result<()> {
    let mode = scfg.mode;
    let session = Rc::new(TrackerSession::new(
        scfg,
        camera,
        detector,
        JpegCropper,
        LogSink,
    ));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let tx = stop_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = tx.send(true);
    });
    if let Some(s) = duration_s {
        let tx = stop_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(s)).await;
            let _ = tx.send(true);
        });
    }

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            if mode == ScanMode::Manual {
                // Stand-in for the user: press the shutter on the strongest
                // visible track every so often.
                let s = session.clone();
                tokio::task::spawn_local(async move {
                    let mut shutter = tokio::time::interval(Duration::from_millis(1500));
                    loop {
                        shutter.tick().await;
                        let best = s
                            .snapshot()
                            .into_iter()
                            .filter(|t| t.frames_since_last_seen == 0)
                            .max_by(|a, b| {
                                a.score
                                    .partial_cmp(&b.score)
                                    .unwrap_or(std::cmp::Ordering::Equal)
                            });
                        let Some(best) = best else { continue };
                        match s.manual_capture(best.id).await {
                            Ok(out) => info!("shutter: track {} -> {:?}", best.id, out),
                            Err(e) => debug!("shutter deferred: {}", e),
                        }
                    }
                });
            }
            session.run(stop_rx).await;
        })
        .await;

    for t in session.snapshot() {
        info!(
            "track {}: label={} score={:.2} missed={}",
            t.id, t.label, t.score, t.frames_since_last_seen
        );
    }
    info!("run: done");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run { duration_s, mode, camera } => {
            run(&cfg, duration_s, mode.as_deref(), camera).await?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [session]
        mode = "auto"
        detect_period_ms = 800
        auto_capture_period_ms = 2500
        drain_poll_ms = 50
        drain_poll_max = 20

        [tracking]
        iou_match_threshold = 0.3
        prune = true

        [overlap]
        nms_iou_threshold = 0.55
        nms_containment_threshold = 0.85
        prune_iou_threshold = 0.35
        prune_containment_threshold = 0.6

        [angle]
        target_count = 4
        min_interval_ms = 3000
        diversity_iou = 0.7
        crop_padding_ratio = 0.2
    "#;

    #[test]
    fn sample_config_parses_and_passes_doctor() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        doctor(&cfg).unwrap();
        let s = build_session_config(&cfg, cfg.session.mode);
        assert_eq!(s.mode, ScanMode::Auto);
        // auto mode default when unset
        assert_eq!(s.tracker.max_missed_frames, 30);
        assert!(s.tracker.prune.is_some());
    }

    #[test]
    fn mode_flag_overrides_config_and_its_defaults() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        let s = build_session_config(&cfg, parse_mode("scan").unwrap());
        assert_eq!(s.mode, ScanMode::Scan);
        // per-mode default follows the override, not the config file
        assert_eq!(s.tracker.max_missed_frames, 5);
        assert!(parse_mode("portrait").is_err());
    }

    #[test]
    fn camera_flag_requires_a_camera_section() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        assert!(real_camera(&cfg).is_err());

        let with_cam = format!(
            "{SAMPLE}\n[camera]\nmode = \"v4l2-mjpeg\"\ndevice = \"/dev/video0\"\n\
             detect_width = 640\ndetect_height = 480\nfull_width = 1920\nfull_height = 1080\n"
        );
        let cfg: Config = toml::from_str(&with_cam).unwrap();
        doctor(&cfg).unwrap();
        assert!(real_camera(&cfg).is_ok());
    }

    #[test]
    fn doctor_rejects_out_of_range_threshold() {
        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.overlap.nms_iou_threshold = 1.5;
        assert!(doctor(&cfg).is_err());
    }

    #[test]
    fn doctor_rejects_auto_period_faster_than_detection() {
        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.session.auto_capture_period_ms = 200;
        assert!(doctor(&cfg).is_err());
    }
}
