//! echo_bench: load generator for the echo server
//!
//! Sends `--count` payloads of `--size` bytes in one transfer mode and
//! prints the throughput. Ask modes verify the digest of every payload the
//! server generated.

use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use stream_echo_rpc::{
    client::RpcClient,
    common::TimeoutOptions,
    digest::{hash, short_hex},
    error::RpcError,
    message::{EchoRequest, EchoResponse},
    payload,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Inline,
    Attachment,
    Streaming,
    ContinueStreaming,
    AskInline,
    AskAttachment,
}

/// Command-line arguments for the benchmark client
#[derive(Parser, Debug)]
#[command(name = "echo_bench")]
#[command(about = "Load generator verifying echo payload integrity", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8010")]
    addr: String,

    /// Transfer mode
    #[arg(short, long, value_enum, default_value_t = Mode::Attachment)]
    mode: Mode,

    /// Payload size in bytes
    #[arg(short, long, default_value_t = 1024 * 1024)]
    size: usize,

    /// Number of calls
    #[arg(short, long, default_value_t = 100)]
    count: usize,

    /// Chunk size of streamed payloads
    #[arg(long, default_value_t = 64 * 1024)]
    chunk_size: usize,

    /// Chunks per digest batch in continue-streaming mode
    #[arg(long)]
    messages_in_batch: Option<u64>,

    /// Read and write timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_s: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

async fn stream_payload(
    client: &RpcClient,
    request: &EchoRequest,
    data: &[u8],
    chunk_size: usize,
) -> Result<(), RpcError<String>> {
    let writer = client.open_stream(request).await?;
    for chunk in data.chunks(chunk_size.max(1)) {
        writer.write(chunk).await?;
    }
    writer.close().await
}

/// Check an ask-echo response against the bytes that came with it.
fn verify_ask(mode: Mode, resp: &EchoResponse, attachment: &Bytes) -> bool {
    let data: &[u8] = match mode {
        Mode::AskInline => resp.inline_data.as_deref().unwrap_or_default(),
        _ => attachment,
    };
    match resp.hash {
        Some(expected) if expected == hash(data) => true,
        Some(expected) => {
            warn!(
                len = data.len(),
                expected_hash = %short_hex(&expected),
                actual_hash = %short_hex(&hash(data)),
                "ask echo hash not match"
            );
            false
        }
        None => {
            warn!("ask echo response carries no hash");
            false
        }
    }
}

async fn run_one(
    client: &RpcClient,
    args: &Args,
    data: &Bytes,
) -> Result<bool, RpcError<String>> {
    let size = args.size as u64;
    match args.mode {
        Mode::Inline => {
            let request = EchoRequest::inline(data.clone(), hash(data));
            client.echo(&request, &[]).await?;
        }
        Mode::Attachment => {
            client
                .echo(&EchoRequest::attachment(size, hash(data)), data)
                .await?;
        }
        Mode::Streaming => {
            let request = EchoRequest::streaming(size, hash(data));
            stream_payload(client, &request, data, args.chunk_size).await?;
        }
        Mode::ContinueStreaming => {
            let mut request = EchoRequest::continue_streaming(size, hash(data));
            request.streaming_messages_in_batch = args.messages_in_batch;
            stream_payload(client, &request, data, args.chunk_size).await?;
        }
        Mode::AskInline | Mode::AskAttachment => {
            let request = if args.mode == Mode::AskInline {
                EchoRequest {
                    inline_size: Some(size),
                    ..Default::default()
                }
            } else {
                EchoRequest {
                    attachment_size: Some(size),
                    ..Default::default()
                }
            };
            let (resp, attachment) = client.ask_echo(&request).await?;
            return Ok(verify_ask(args.mode, &resp, &attachment));
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let timeout_options = TimeoutOptions {
        read_timeout: Duration::from_secs(args.timeout_s),
        write_timeout: Duration::from_secs(args.timeout_s),
        idle_timeout: Duration::from_secs(args.timeout_s),
    };
    let client = RpcClient::connect(&args.addr, timeout_options).await?;
    info!(addr = %args.addr, mode = ?args.mode, size = args.size, count = args.count, "Connected");

    // Ask modes get their payload from the server.
    let data = match args.mode {
        Mode::AskInline | Mode::AskAttachment => Bytes::new(),
        _ => Bytes::from(payload::generate(args.size)),
    };

    let start = Instant::now();
    let mut failed = 0usize;
    for i in 0..args.count {
        match run_one(&client, &args, &data).await {
            Ok(true) => debug!(call = i, "call finished"),
            Ok(false) => failed += 1,
            Err(err) => {
                warn!(call = i, error = %err, "call failed");
                failed += 1;
            }
        }
    }
    let elapsed = start.elapsed();

    let total_mb = (args.size * args.count) as f64 / 1024.0 / 1024.0;
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "mode={:?} size={} count={} failed={} elapsed={:?} throughput={:.2} MB/s",
        args.mode,
        args.size,
        args.count,
        failed,
        elapsed,
        total_mb / secs
    );
    Ok(())
}
