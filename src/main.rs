use std::path::PathBuf;
use std::process;
use std::str::FromStr;

use clap::{Arg, ArgMatches, Command};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use MatrixRadar::sim::Simulation;
use MatrixRadar::trace::read_trace;
use MatrixRadar::{RadarConfig, RadarError, RadarResult};

fn command() -> Command<'static> {
    Command::new("MatrixRadar simulator")
        .version("0.1.0")
        .about("Replay a pcap trace through sketch measurement and mice/elephant queue control")
        .arg(Arg::new("filename")
             .short('f')
             .long("file")
             .takes_value(true)
             .default_value("./test.pcap")
             .help("pcap file"))
        .arg(Arg::new("switches")
             .long("switches")
             .takes_value(true)
             .default_value("1")
             .help("switches on the replay path"))
        .arg(Arg::new("num_blocks")
             .short('n')
             .long("num_blocks")
             .takes_value(true)
             .default_value("10")
             .help("blocks per sketch"))
        .arg(Arg::new("cells")
             .short('S')
             .long("cells")
             .takes_value(true)
             .default_value("1000")
             .help("counters per block"))
        .arg(Arg::new("kcells")
             .short('K')
             .long("kcells")
             .takes_value(true)
             .default_value("4")
             .help("hash functions per flow inside a block"))
        .arg(Arg::new("flow_table")
             .long("flow_table")
             .takes_value(true)
             .help("flow table entries per block [default: 8 * cells]"))
        .arg(Arg::new("bf_size")
             .short('s')
             .long("bf_size")
             .takes_value(true)
             .default_value("4194304")
             .help("novelty filter size in bits"))
        .arg(Arg::new("k_bloom_filter")
             .short('k')
             .long("kbf")
             .takes_value(true)
             .default_value("20")
             .help("hash functions for the novelty filter"))
        .arg(Arg::new("period")
             .short('e')
             .long("period")
             .takes_value(true)
             .default_value("0.5")
             .help("time between decode cycles"))
        .arg(Arg::new("end")
             .long("end")
             .takes_value(true)
             .help("stop the replay at this time"))
        .arg(Arg::new("seed")
             .long("seed")
             .takes_value(true)
             .default_value("0")
             .help("base seed of the sketch hashes"))
        .arg(Arg::new("elephant_fraction")
             .long("elephant_fraction")
             .takes_value(true)
             .default_value("0.5")
             .help("fraction of a port's flows treated as elephants"))
        .arg(Arg::new("mice_expansion")
             .long("mice_expansion")
             .takes_value(true)
             .default_value("1.2")
             .help("inflation of the mice capacity share"))
        .arg(Arg::new("drop_rate")
             .long("drop_rate")
             .takes_value(true)
             .default_value("0.0")
             .help("AQM drop rate of elephant packets"))
        .arg(Arg::new("queue_capacity")
             .short('q')
             .long("queue_capacity")
             .takes_value(true)
             .default_value("150")
             .help("packets per port queue"))
        .arg(Arg::new("ports")
             .short('p')
             .long("ports")
             .takes_value(true)
             .default_value("4")
             .help("output ports per switch"))
        .arg(Arg::new("link_rate")
             .long("link_rate")
             .takes_value(true)
             .default_value("1250000000")
             .help("port drain rate in bytes per second"))
        .arg(Arg::new("offline")
             .short('o')
             .long("offline")
             .takes_value(false)
             .help("dump blocks instead of decoding them"))
        .arg(Arg::new("output")
             .short('d')
             .long("output")
             .takes_value(true)
             .help("directory for flow and block files"))
        .arg(Arg::new("log_level")
             .long("log_level")
             .takes_value(true)
             .default_value("info")
             .possible_values(["trace", "debug", "info", "warn", "error"])
             .help("log verbosity"))
}

fn value<T: FromStr>(matches: &ArgMatches, name: &str) -> RadarResult<T> {
    let raw = matches
        .value_of(name)
        .ok_or_else(|| RadarError::InvalidConfig(format!("missing --{}", name)))?;
    raw.parse::<T>()
        .map_err(|_| RadarError::InvalidConfig(format!("invalid value {:?} for --{}", raw, name)))
}

fn optional<T: FromStr>(matches: &ArgMatches, name: &str) -> RadarResult<Option<T>> {
    if matches.is_present(name) {
        value(matches, name).map(Some)
    } else {
        Ok(None)
    }
}

fn config_from(matches: &ArgMatches) -> RadarResult<RadarConfig> {
    let cells_per_block = value(matches, "cells")?;
    Ok(RadarConfig {
        num_blocks: value(matches, "num_blocks")?,
        cells_per_block,
        cell_hashes: value(matches, "kcells")?,
        flow_table_capacity: optional(matches, "flow_table")?.unwrap_or(8 * cells_per_block),
        filter_size: value(matches, "bf_size")?,
        filter_hashes: value(matches, "k_bloom_filter")?,
        period: value(matches, "period")?,
        end_time: optional(matches, "end")?,
        hash_seed: value(matches, "seed")?,
        elephant_fraction: value(matches, "elephant_fraction")?,
        mice_expansion: value(matches, "mice_expansion")?,
        elephant_drop_rate: value(matches, "drop_rate")?,
        queue_capacity: value(matches, "queue_capacity")?,
        ports_per_switch: value(matches, "ports")?,
        link_rate: value(matches, "link_rate")?,
        offline: matches.is_present("offline"),
        output_dir: optional::<PathBuf>(matches, "output")?,
        ..RadarConfig::default()
    })
}

fn run(matches: &ArgMatches) -> RadarResult<bool> {
    let mut config = config_from(matches)?;
    config.initial_mice_capacity = config.initial_mice_capacity.min(config.queue_capacity);
    let switches = value(matches, "switches")?;
    let trace = read_trace(value::<PathBuf>(matches, "filename")?)?;

    let mut sim = Simulation::new(config, switches)?;
    let summary = sim.run(trace.packets);
    for failure in &summary.failures {
        error!(time = failure.time, switch = failure.switch_id, error = %failure.error, "cycle failed");
    }
    for (time, switch_id, acc) in &summary.accuracy {
        info!(
            time,
            switch = switch_id,
            flows = acc.num_flows,
            exact = acc.num_exact,
            near_exact = acc.num_near_exact,
            aae = acc.aae,
            are = acc.are,
            "accuracy"
        );
    }
    Ok(summary.is_success())
}

fn main() {
    let matches = command().get_matches();
    let level = matches
        .value_of("log_level")
        .and_then(|l| Level::from_str(l).ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install the log subscriber");
    }

    let args: Vec<String> = std::env::args().collect();
    info!("command line is: {:?}", &args);

    match run(&matches) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "aborted");
            process::exit(1);
        }
    }
}
