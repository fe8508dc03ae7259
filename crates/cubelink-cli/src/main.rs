// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use anyhow::Result;
use chrono::Local;
use clap::{CommandFactory, FromArgMatches, Parser};
use directories_next::ProjectDirs;
use env_logger::fmt::Formatter;
use env_logger::Builder;
use log::*;
use std::{env, io::Write, path::Path, sync::Arc};
use tokio::{
    signal,
    sync::Notify,
    time::{interval, Duration, Instant},
};

use cubelink_link::{ld_type, SimulatedTransport, TransportId, TransportSet};
use cubelink_station::{
    codes, storage, Action, BeaconReport, DirStorage, Sensors, Station, StationConfig,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        alias = "data-dir",
        help = "The data directory",
        default_value_t = default_data_dir() // Use a function for default value
    )]
    data_dir: String,

    #[arg(long, help = "Spacecraft config JSON, optional")]
    spacecraft_config: Option<String>,

    #[arg(long, help = "Ground station config JSON, optional")]
    ground_config: Option<String>,

    #[arg(long, default_value_t = 10, help = "Loop period in ms")]
    tick_ms: u64,

    #[arg(long, default_value_t = 0.0, help = "Simulated frame loss in [0, 1]")]
    loss: f32,

    #[arg(long, help = "Request this outbox file from the spacecraft")]
    get_file: Option<u16>,

    #[arg(long, help = "Run a ranging session against the spacecraft")]
    ranging: bool,
}

fn default_data_dir() -> String {
    ProjectDirs::from("com", "bonsai", "cubelink")
        .map(|dirs| dirs.data_dir().to_string_lossy().to_string())
        .unwrap_or_else(|| "~/.cubelink".to_string())
}

fn build_args_with_help() -> Result<Args> {
    let default_dir = default_data_dir();
    let default_dir_static: &'static str = Box::leak(default_dir.into_boxed_str());
    let mut cmd = Args::command();
    cmd = cmd.mut_arg("data_dir", |arg| {
        arg.help(format!(
            "The data directory, defaults to {}",
            default_dir_static
        ))
        .default_value(default_dir_static)
    });
    Ok(Args::from_arg_matches(&cmd.get_matches())?)
}

fn init_logger() {
    let mut builder = Builder::new();
    if let Ok(rust_log) = env::var("RUST_LOG") {
        builder.parse_filters(&rust_log);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    builder
        .format(|buf: &mut Formatter, record: &Record| {
            let now = Local::now();
            writeln!(
                buf,
                "{} {:<5} {}: {}",
                now.format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

fn load_config(path: &Option<String>, default: StationConfig) -> Result<StationConfig> {
    Ok(match path {
        Some(path) => StationConfig::load(path)?,
        None => default,
    })
}

// both ends of every transport, wired back to back
fn simulated_links(loss: f32) -> (TransportSet, TransportSet) {
    let mut spacecraft = TransportSet::new();
    let mut ground = TransportSet::new();
    for id in TransportId::ALL {
        let (a, b) = SimulatedTransport::pair(id);
        spacecraft.insert(Box::new(a.with_loss(loss)));
        ground.insert(Box::new(b.with_loss(loss)));
    }
    (spacecraft, ground)
}

fn report(side: &str, action: &Action) {
    match action {
        Action::Telemetry(telemetry) => match &telemetry.report {
            BeaconReport::Long(status) => info!(
                "{}: beacon from 0x{:02x} on {}: {:?}",
                side, telemetry.source, telemetry.transport, status
            ),
            BeaconReport::Short(beacon) => debug!(
                "{}: short beacon from 0x{:02x}: {:?}",
                side, telemetry.source, beacon
            ),
        },
        Action::RangingComplete(summary) => match serde_json::to_string(summary) {
            Ok(json) => info!("{}: ranging complete: {}", side, json),
            Err(err) => warn!("{}: ranging summary: {}", side, err),
        },
        other => info!("{}: {:?}", side, other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let stop_signal = Arc::new(Notify::new());
    let args = build_args_with_help()?;

    let data_dir = Path::new(&args.data_dir);
    let spacecraft_config = load_config(&args.spacecraft_config, StationConfig::spacecraft())?;
    let ground_config = load_config(&args.ground_config, StationConfig::ground_station())?;

    let start = Instant::now();
    let elapsed_ms = || start.elapsed().as_millis() as u64;

    let mut spacecraft = Station::new(
        spacecraft_config,
        Box::new(DirStorage::new(data_dir.join("spacecraft"))?),
        elapsed_ms(),
    )?;
    let mut ground = Station::new(
        ground_config,
        Box::new(DirStorage::new(data_dir.join("ground"))?),
        elapsed_ms(),
    )?;
    spacecraft.set_sensors(Sensors {
        battery_mv: 3900,
        battery_ma: 180,
        temp1: 18,
        temp2: 21,
    });
    let (mut spacecraft_links, mut ground_links) = simulated_links(args.loss);

    if let Some(file_seq) = args.get_file {
        if storage::find_file(spacecraft.storage(), file_seq)?.is_none() {
            // something to download
            let text = format!("cubelink sample file {}\n", file_seq).repeat(40);
            let name = storage::in_folder(
                storage::FOLDER_OUTBOX,
                &storage::file_name(file_seq, ld_type::TEXT),
            );
            info!("writing sample file {}", name);
            spacecraft.storage_mut().write(&name, text.as_bytes())?;
        }
        ground.send_command(codes::GET_FILE, &file_seq.to_le_bytes())?;
    }
    if args.ranging {
        ground.send_command(codes::RANGING_SLAVE_24, &[0])?;
    }
    let mut ranging_started = false;

    let stopper = stop_signal.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received ^C, shutting down.");
            stopper.notify_one();
        }
    });

    info!("waiting for ^C to terminate ...");
    let mut ticker = interval(Duration::from_millis(args.tick_ms.max(1)));
    loop {
        tokio::select! {
            _ = stop_signal.notified() => break,
            _ = ticker.tick() => {
                let now = elapsed_ms();
                for action in spacecraft.tick(now, &mut spacecraft_links) {
                    report("spacecraft", &action);
                }
                for action in ground.tick(now, &mut ground_links) {
                    let slave_ready = matches!(
                        &action,
                        Action::CommandReply {
                            code: codes::RANGING_SLAVE_24,
                            status: codes::CMD_COMPLETED,
                            ..
                        }
                    );
                    if args.ranging && slave_ready && !ranging_started {
                        ground.start_ranging(now)?;
                        ranging_started = true;
                    }
                    report("ground", &action);
                }
            }
        }
    }

    // persist operating time
    drop(spacecraft.into_storage());
    drop(ground.into_storage());
    Ok(())
}
