//! codecwarp-bench - drive a codec session with synthetic frames
//!
//! Pushes frames through an encoder session backed by the mock codec,
//! backing off while the session reports saturation, and prints
//! throughput and delivery statistics at the end.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use codecwarp_codec::{MockCodecConfig, MockCodecFactory};
use codecwarp_core::{Frame, QueueLimits, ScalabilityMode, SessionConfig, SessionError};
use codecwarp_engine::{CodecSession, SessionHandlers};

/// codecwarp bench - measure session throughput with a mock codec
#[derive(Parser, Debug)]
#[command(name = "codecwarp-bench")]
#[command(about = "Push synthetic frames through a codec session")]
struct Args {
    /// Number of frames to submit
    #[arg(short, long, default_value_t = 600)]
    frames: u64,

    /// Frame width
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Frame height
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Frames per second used for timestamps
    #[arg(long, default_value_t = 60)]
    fps: u32,

    /// Payload size per frame in bytes
    #[arg(long, default_value_t = 4096)]
    payload_size: usize,

    /// Soft queue limit
    #[arg(long, default_value_t = 16)]
    soft_limit: usize,

    /// Hard queue limit
    #[arg(long, default_value_t = 64)]
    hard_limit: usize,

    /// Flush every N frames (0 = only at the end)
    #[arg(long, default_value_t = 0)]
    flush_every: u64,

    /// Keyframe interval in frames
    #[arg(long, default_value_t = 60)]
    keyframe_interval: u64,

    /// Frames the mock codec holds back
    #[arg(long, default_value_t = 0)]
    lookahead: usize,

    /// Reorder outputs in pairs
    #[arg(long)]
    reorder: bool,

    /// Simulated codec latency per frame, in microseconds
    #[arg(long, default_value_t = 500)]
    latency_us: u64,

    /// Scalability mode (L1T1, L1T2, L1T3)
    #[arg(long, value_parser = parse_mode)]
    scalability: Option<ScalabilityMode>,
}

fn parse_mode(s: &str) -> Result<ScalabilityMode, SessionError> {
    s.parse()
}

#[derive(Debug, Default)]
struct Stats {
    outputs: u64,
    bytes: u64,
    boundaries: u64,
    errors: u64,
    layers: Vec<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("codecwarp=info".parse()?))
        .init();

    let args = Args::parse();

    info!("codecwarp-bench starting");
    info!(
        "{} frames of {} bytes, {}x{} @ {}fps, limits {}/{}",
        args.frames,
        args.payload_size,
        args.width,
        args.height,
        args.fps,
        args.soft_limit,
        args.hard_limit
    );

    run_bench(&args).await
}

async fn run_bench(args: &Args) -> Result<()> {
    let factory = MockCodecFactory::new(MockCodecConfig {
        lookahead: args.lookahead,
        reorder: args.reorder,
        submit_delay: Duration::from_micros(args.latency_us),
        description: Some(Bytes::from_static(b"mock-parameter-sets")),
        coded_size: Some((args.width, args.height)),
        keyframe_interval: args.keyframe_interval,
        max_inits: None,
    });
    let codec_stats = factory.stats();

    let mut config = SessionConfig::encoder("mock", args.width, args.height)
        .with_limits(QueueLimits::new(args.soft_limit, args.hard_limit));
    if let Some(mode) = args.scalability {
        config = config.with_scalability(mode);
    }
    let layers = args.scalability.map_or(1, |m| m.temporal_layers()) as usize;

    let stats = Arc::new(Mutex::new(Stats {
        layers: vec![0; layers],
        ..Default::default()
    }));
    let output_stats = Arc::clone(&stats);
    let error_stats = Arc::clone(&stats);
    let handlers = SessionHandlers::new(
        move |event| {
            let mut stats = output_stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.outputs += 1;
            stats.bytes += event.data.len() as u64;
            if event.is_boundary {
                stats.boundaries += 1;
            }
            if let Some(layer) = event.temporal_layer {
                if let Some(count) = stats.layers.get_mut(layer as usize) {
                    *count += 1;
                }
            }
        },
        move |event| {
            match event.sequence_id {
                Some(id) => warn!("item {} failed: {}", id, event.message),
                None => warn!("session failed: {}", event.message),
            }
            let mut stats = error_stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.errors += 1;
        },
    );

    let session = CodecSession::new(factory);
    session
        .configure(config, handlers)
        .context("Failed to configure session")?;

    let frame_duration = 1_000_000 / u64::from(args.fps.max(1));
    let started = Instant::now();
    let mut rejected = 0u64;
    let mut stall_flushes = 0u64;

    for i in 0..args.frames {
        // Back off while saturated; a codec holding more frames than the
        // soft limit only releases them on flush
        let mut waited = Duration::ZERO;
        while session.is_saturated() {
            if waited >= Duration::from_millis(20) {
                debug!("saturated for {:?}, flushing", waited);
                session.flush().await.context("Flush failed")?;
                stall_flushes += 1;
                break;
            }
            tokio::time::sleep(Duration::from_micros(200)).await;
            waited += Duration::from_micros(200);
        }

        let payload = Bytes::from(vec![(i % 251) as u8; args.payload_size.max(1)]);
        let mut frame = Frame::new(payload, (i * frame_duration) as i64).with_duration(frame_duration);
        if args.keyframe_interval > 0 && i % args.keyframe_interval == 0 {
            frame = frame.key();
        }

        match session.encode(frame) {
            Ok(_) => {}
            Err(SessionError::ResourceExhausted { depth, limit }) => {
                debug!("rejected frame {}: depth {} at limit {}", i, depth, limit);
                rejected += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Err(e) => return Err(e).context("Encode failed"),
        }

        if args.flush_every > 0 && (i + 1) % args.flush_every == 0 {
            session.flush().await.context("Flush failed")?;
        }
    }

    session.flush().await.context("Final flush failed")?;
    let elapsed = started.elapsed();

    session.close();
    session.closed().await;

    let stats = stats.lock().unwrap_or_else(|e| e.into_inner());
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        "{} outputs ({} bytes) in {:.2?}: {:.1} frames/s",
        stats.outputs,
        stats.bytes,
        elapsed,
        stats.outputs as f64 / secs
    );
    info!(
        "{} boundaries, {} errors, {} rejected, {} stall flushes",
        stats.boundaries, stats.errors, rejected, stall_flushes
    );
    info!(
        "codec: {} inits, {} submitted, {} produced",
        codec_stats.inits(),
        codec_stats.submitted(),
        codec_stats.produced()
    );
    if layers > 1 {
        for (layer, count) in stats.layers.iter().enumerate() {
            info!("temporal layer {}: {} outputs", layer, count);
        }
    }

    Ok(())
}
