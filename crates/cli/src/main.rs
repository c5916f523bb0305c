use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vidlink::transport::udp::{bind_receiver, bind_sender, resolve};
use vidlink::{
    Frame, PassthroughEncoder, StreamConfig, StreamReceiver, StreamSender, TestPatternSource,
};

#[derive(Parser)]
#[command(name = "vidlink", about = "Send or receive live video frames over UDP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a test pattern (or a file's bytes as every frame) to a receiver
    Send(SendArgs),
    /// Receive, reassemble and optionally store frames
    Recv(RecvArgs),
}

#[derive(Args)]
struct SendArgs {
    /// Receiver address (host:port)
    #[arg(long, short)]
    dest: String,

    /// Local bind address
    #[arg(long, short, default_value = "0.0.0.0:0")]
    bind: String,

    /// Frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Datagram size budget in bytes, header included
    #[arg(long, default_value_t = 1400)]
    mtu: usize,

    /// Size of the generated test frame in bytes
    #[arg(long, default_value_t = 4096, conflicts_with = "frame_file")]
    frame_size: usize,

    /// Send this file's contents as every frame
    #[arg(long)]
    frame_file: Option<PathBuf>,

    /// Stop after this many frames instead of waiting for Enter
    #[arg(long)]
    frames: Option<u64>,
}

#[derive(Args)]
struct RecvArgs {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:5004")]
    bind: String,

    /// Expected frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Sender's datagram size budget; larger datagrams are still accepted
    #[arg(long, default_value_t = 1400)]
    mtu: usize,

    /// How long a received packet may wait before assembly, in milliseconds
    #[arg(long, default_value_t = 100)]
    ttl_ms: u64,

    /// Write each frame to DIR/<timestamp>.bin
    #[arg(long, short)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Send(args) => send(args),
        Command::Recv(args) => recv(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vidlink: {e}");
            ExitCode::FAILURE
        }
    }
}

fn send(args: SendArgs) -> vidlink::Result<()> {
    let config = StreamConfig {
        fps: args.fps,
        mtu: args.mtu,
        ..StreamConfig::default()
    };
    let destination = resolve(&args.dest)?;

    let mut source = match &args.frame_file {
        Some(path) => TestPatternSource::new(fs::read(path)?, args.fps),
        None => TestPatternSource::with_size(args.frame_size, args.fps),
    };
    if let Some(frames) = args.frames {
        source = source.limit(frames);
    }

    let mut sender = StreamSender::new(&config, destination)?;
    sender.start(bind_sender(args.bind.as_str())?, Box::new(source), Box::new(PassthroughEncoder))?;

    if args.frames.is_some() {
        println!("Sending to {destination}");
        sender.wait();
    } else {
        println!("Sending to {destination}, press Enter to stop");
        wait_for_enter();
        sender.stop();
    }

    let stats = sender.stats();
    println!(
        "frames: {}  packets: {}  failed: {}  bytes: {}  skipped: {}  encode errors: {}",
        stats.frames,
        stats.packets_sent,
        stats.packets_failed,
        stats.bytes,
        stats.skipped,
        stats.encode_failures
    );
    Ok(())
}

fn recv(args: RecvArgs) -> vidlink::Result<()> {
    let config = StreamConfig {
        fps: args.fps,
        mtu: args.mtu,
        packet_ttl: Duration::from_millis(args.ttl_ms),
        ..StreamConfig::default()
    };
    let mut receiver = StreamReceiver::new(config.clone())?;

    if let Some(dir) = args.output {
        fs::create_dir_all(&dir)?;
        receiver.add_subscriber(Arc::new(move |frame: &Frame| {
            let path = dir.join(format!("{}.bin", frame.timestamp));
            if let Err(e) = fs::write(&path, &frame.data) {
                tracing::warn!(path = %path.display(), error = %e, "failed to write frame");
            }
        }));
    }

    let socket = bind_receiver(args.bind.as_str(), &config)?;
    receiver.start(socket)?;

    println!("Receiving on {}, press Enter to stop", args.bind);
    wait_for_enter();
    receiver.stop();

    let stats = receiver.stats();
    println!(
        "frames: {}  concealed: {}  abandoned: {}  late packets: {}",
        stats.assembler.completed,
        stats.assembler.concealed,
        stats.assembler.abandoned,
        stats.assembler.late_packets
    );
    println!(
        "packets: {}  malformed: {}  expired: {}  evicted: {}  jitter: {:.2} ms",
        stats.ingress.received,
        stats.ingress.malformed,
        stats.ingress.expired,
        stats.ingress.evicted,
        stats.jitter_ms
    );
    Ok(())
}

fn wait_for_enter() {
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "failed to read stdin");
    }
}
