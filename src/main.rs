use anyhow::{Result, bail};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

use tmf882x_lib::TofAttribute;
use tmf882x_lib::attr;
use tmf882x_rs::device::{DeviceArgs, SimTof, attach_simulated};
use tmf882x_rs::logging::setup_logging;

/// Read and write TMF882x driver attributes.
///
/// Each operation is either `name` (print the attribute) or `name=value`
/// (write it). Operations run in order against one attached device.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Attribute operations, e.g. `mode`, `report_period_ms=100`.
    ops: Vec<String>,
    /// List every attribute with its access and exit.
    #[arg(long)]
    list: bool,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    device: DeviceArgs,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Debug)]
enum Op {
    Show(TofAttribute),
    Store(TofAttribute, String),
}

fn parse_op(text: &str) -> Result<Op> {
    let (name, value) = match text.split_once('=') {
        Some((name, value)) => (name.trim(), Some(value)),
        None => (text.trim(), None),
    };
    let Some(attribute) = TofAttribute::from_name(name) else {
        bail!("Unknown attribute '{}', see --list", name);
    };
    Ok(match value {
        Some(value) => Op::Store(attribute, value.to_string()),
        None => Op::Show(attribute),
    })
}

fn print_attributes() {
    for attribute in TofAttribute::ALL {
        let access = match (attribute.is_readable(), attribute.is_writable()) {
            (true, true) => "rw",
            (true, false) => "r-",
            (false, true) => "-w",
            (false, false) => "--",
        };
        println!("{} {}", access, attribute);
    }
}

async fn run(tof: &SimTof, ops: &[Op]) -> Result<()> {
    let mut state = tof.lock().await;
    for op in ops {
        match op {
            Op::Show(attribute) => {
                let text = attr::show(&mut *state, *attribute).await?;
                print!("{}: {}", attribute, text);
            }
            Op::Store(attribute, value) => {
                attr::store(&mut *state, *attribute, value).await?;
                info!(attribute = %attribute, value = %value, "Attribute written");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file, &cli.verbose)?;

    if cli.list {
        print_attributes();
        return Ok(());
    }
    let ops = cli.ops.iter().map(|op| parse_op(op)).collect::<Result<Vec<_>>>()?;

    let (_sim, tof) = attach_simulated(&cli.device).await?;
    let result = run(&tof, &ops).await;
    tof.remove().await;

    if let Err(e) = result {
        error!("Attribute operation failed: {:?}", e);
        process::exit(1);
    }
    Ok(())
}
