use anyhow::{Context, Result, bail};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use tmf882x_lib::message::{MessageHeader, decode_header};
use tmf882x_lib::sim::SimulatedTmf882x;
use tmf882x_lib::{InputEvent, Message, OpenFlags, TofError};
use tmf882x_rs::device::{DeviceArgs, SimTof, attach_simulated};
use tmf882x_rs::logging::setup_logging;

/// Stream framed measurement messages from a simulated TMF882x.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of messages to read before stopping.
    #[arg(short = 'n', long, default_value_t = 10)]
    count: usize,
    /// Interval between simulated measurement cycles, in milliseconds.
    #[arg(short, long, default_value_t = 33)]
    interval_ms: u64,
    /// Print each message as hex instead of decoding it.
    #[arg(long)]
    raw: bool,
    /// Also print the input events published for each result.
    #[arg(short, long)]
    events: bool,
    /// Read buffer size; a buffer can take several whole messages.
    #[arg(long, default_value_t = 1024)]
    buffer: usize,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    device: DeviceArgs,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    let (sim, tof) = attach_simulated(&cli.device).await?;
    let result = run_stream(&cli, &sim, &tof).await;
    tof.remove().await;

    if let Err(e) = result {
        error!("Streaming failed: {:?}", e);
        process::exit(1);
    }
    Ok(())
}

async fn run_stream(cli: &Cli, sim: &SimulatedTmf882x, tof: &SimTof) -> Result<()> {
    let mut reader = tof.open(OpenFlags::read_only()).await.context("Failed to open stream")?;
    tof.lock().await.start_capture().await.context("Failed to start capture")?;

    let events = cli.events.then(|| tokio::spawn(print_events(tof.subscribe_events())));
    let feeder = tokio::spawn(feed_results(sim.clone(), Duration::from_millis(cli.interval_ms.max(1))));

    info!(count = cli.count, "Reading messages");
    let mut buf = vec![0u8; cli.buffer];
    let mut seen = 0;
    while seen < cli.count {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                warn!("Stream ended");
                break;
            }
            Ok(n) => n,
            Err(TofError::InvalidArgument(e)) => {
                error!("{}", e);
                break;
            }
            Err(e) => return Err(e).context("Read failed"),
        };
        let mut chunk = &buf[..n];
        while !chunk.is_empty() {
            let header = decode_header(chunk).context("Malformed message in stream")?;
            if header.length as usize > chunk.len() {
                bail!("Message of {} bytes truncated to {}", header.length, chunk.len());
            }
            let (frame, rest) = chunk.split_at(header.length as usize);
            print_message(cli.raw, &header, frame)?;
            chunk = rest;
            seen += 1;
        }
    }

    feeder.abort();
    let mut state = tof.lock().await;
    state.stop_capture().await.context("Failed to stop capture")?;
    drop(state);
    reader.close().await;
    if let Some(task) = events {
        task.abort();
    }
    Ok(())
}

/// Stand-in for the sensor's measurement clock.
async fn feed_results(sim: SimulatedTmf882x, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if !sim.inject_synthetic_result() {
            debug!("Device not measuring, result dropped");
        }
    }
}

fn print_message(raw: bool, header: &MessageHeader, frame: &[u8]) -> Result<()> {
    if raw {
        println!("{}", hex::encode(frame));
        return Ok(());
    }
    match Message::decode(frame).with_context(|| format!("Failed to decode {:?} message", header.id))? {
        Message::MeasResults(meas) => {
            println!(
                "#{:<3} tick={:<10} temp={}C ambient={} photons={} results={}",
                meas.result_num,
                meas.sys_tick,
                meas.temperature_c,
                meas.ambient_light,
                meas.photon_count,
                meas.results.len()
            );
            for r in &meas.results {
                println!(
                    "    ch{} sub{} conf={:<3} {} mm",
                    r.channel, r.sub_capture, r.confidence, r.distance_mm
                );
            }
        }
        Message::Error(code) => println!("error: {:?}", code),
        Message::Unknown { id, payload } => println!("unknown id={:#06x} payload={}", id, hex::encode(payload)),
    }
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<InputEvent>) {
    loop {
        match events.recv().await {
            Ok(InputEvent::Abs { code, value }) => println!("  event abs code={} value={:#010x}", code, value),
            Ok(InputEvent::Sync) => println!("  event sync"),
            Err(RecvError::Lagged(missed)) => warn!(missed, "Event subscriber lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
