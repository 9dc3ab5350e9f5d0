mod config;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rtsp_ingest::{Frame, PixelFormat, ServerConfig, StreamConfig, StreamServer};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rtsp-ingest-server",
    about = "RTSP server fed by a synthetic test pattern"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Stream name, served at rtsp://<host>/<name>. Repeatable.
    #[arg(long = "stream", short, default_value = "cam0")]
    streams: Vec<String>,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    #[arg(long, default_value_t = rtsp_ingest::config::DEFAULT_FPS)]
    fps: u32,

    /// Target bitrate in bits per second
    #[arg(long, default_value_t = rtsp_ingest::config::DEFAULT_BITRATE_BPS)]
    bitrate: u32,

    /// Keyframe interval in frames (defaults to one second)
    #[arg(long)]
    gop: Option<u32>,

    /// Host advertised in SDP instead of the one the client dialed
    #[arg(long)]
    public_host: Option<String>,

    /// TOML file overriding the options above
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let stream_defaults = StreamConfig {
        fps: args.fps,
        bitrate_bps: args.bitrate,
        gop: args.gop.unwrap_or(args.fps),
        ..StreamConfig::with_dimensions(args.width, args.height)
    };
    let mut server_config = ServerConfig {
        bind_addr: args.bind.clone(),
        public_host: args.public_host.clone(),
        stream_defaults: stream_defaults.clone(),
        ..ServerConfig::default()
    };
    let mut streams: Vec<(String, StreamConfig)> = args
        .streams
        .iter()
        .map(|name| (name.clone(), stream_defaults.clone()))
        .collect();

    if let Some(path) = &args.config {
        let file = config::load(path)?;
        file.server.apply(&mut server_config);
        for section in &file.streams {
            let stream_config = section.to_stream_config(&stream_defaults);
            match streams.iter_mut().find(|(name, _)| *name == section.name) {
                Some(existing) => existing.1 = stream_config,
                None => streams.push((section.name.clone(), stream_config)),
            }
        }
        tracing::info!(path = %path.display(), "loaded config file");
    }

    let mut server = StreamServer::new(server_config);
    server.start().context("failed to start RTSP server")?;
    let server = Arc::new(server);

    let running = Arc::new(AtomicBool::new(true));
    let mut producers = Vec::new();
    for (name, stream_config) in streams {
        server
            .try_initialize_with(&name, stream_config.clone())
            .with_context(|| format!("failed to initialize stream {name}"))?;
        producers.push(spawn_pattern(
            server.clone(),
            name,
            &stream_config,
            running.clone(),
        )?);
    }

    let addr = server
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or(args.bind);
    for name in server.stream_names() {
        tracing::info!(url = %format!("rtsp://{addr}/{name}"), "serving stream");
    }
    println!("RTSP server on {addr}, press Enter to stop");

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    running.store(false, Ordering::SeqCst);
    for producer in producers {
        let _ = producer.join();
    }
    for name in server.stream_names() {
        if let Some(stats) = server.stream_stats(&name) {
            tracing::info!(stream = %name, ?stats, "final stream stats");
        }
    }
    // Last reference: dropping the server shuts it down.
    drop(server);
    Ok(())
}

/// Push a moving BGR24 gradient into `name` at the stream's frame rate.
fn spawn_pattern(
    server: Arc<StreamServer>,
    name: String,
    config: &StreamConfig,
    running: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<()>> {
    let width = config.width.unwrap_or(640);
    let height = config.height.unwrap_or(480);
    let interval = Duration::from_secs(1) / config.fps.max(1);

    thread::Builder::new()
        .name(format!("pattern-{name}"))
        .spawn(move || {
            let epoch = Instant::now();
            let mut pixels = vec![0u8; (width * height * 3) as usize];
            let mut n: u32 = 0;
            while running.load(Ordering::SeqCst) {
                draw_pattern(&mut pixels, width, height, n);
                let frame = Frame::new(&pixels, width, height, PixelFormat::Bgr24, epoch.elapsed());
                server.put_frame(&name, &frame);
                n = n.wrapping_add(1);

                let next = interval * n;
                if let Some(wait) = next.checked_sub(epoch.elapsed()) {
                    thread::sleep(wait);
                }
            }
        })
        .context("failed to spawn pattern thread")
}

fn draw_pattern(pixels: &mut [u8], width: u32, height: u32, n: u32) {
    let shift = n.wrapping_mul(4);
    for (y, row) in pixels.chunks_exact_mut(width as usize * 3).enumerate() {
        for (x, px) in row.chunks_exact_mut(3).enumerate() {
            let x = x as u32;
            let y = y as u32;
            px[0] = ((x + shift % width) % width * 255 / width) as u8;
            px[1] = (y * 255 / height.max(1)) as u8;
            px[2] = ((x ^ y).wrapping_add(shift)) as u8;
        }
    }
}
