use clap::{Arg, ArgAction, Command, value_parser};
use nrmx_pipeline::{
    config::MeasurementConfig,
    nrmx::LinkDirection,
    orchestrator::{Orchestrator, RunControl},
    report,
    sim::{SimBehavior, SimDriver},
};
use status_line::StatusLine;
use std::{
    error::Error,
    fmt::Display,
    io::{self, BufRead, IsTerminal, Write},
    path::PathBuf,
    process::exit,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use thread_priority::{ThreadPriority, set_current_thread_priority};

#[derive(Clone)]
struct Progress {
    completed: Arc<AtomicU64>,
    last_cycle_micros: Arc<AtomicU64>,
    total: usize,
}

impl Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let completed = self.completed.load(Ordering::Relaxed);
        let last = self.last_cycle_micros.load(Ordering::Relaxed);
        write!(
            f,
            "Iteration {}/{} \t last cycle {:.02} ms",
            completed,
            self.total,
            last as f64 / 1000.0
        )
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let matches = Command::new("nrmx-pipeline")
        .about("Pipelined 5G NR ModAcc/ACP/CHP/OBW/SEM measurement timing")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .help("TOML measurement configuration"),
        )
        .arg(
            Arg::new("resource")
                .short('r')
                .long("resource")
                .env("NRMX_RESOURCE")
                .help("Instrument resource name"),
        )
        .arg(
            Arg::new("iterations")
                .short('n')
                .long("iterations")
                .value_parser(value_parser!(usize))
                .help("Number of measurement cycles"),
        )
        .arg(
            Arg::new("link-direction")
                .long("link-direction")
                .value_parser(["uplink", "downlink"])
                .help("Link direction of the carrier"),
        )
        .arg(
            Arg::new("acquisition-time")
                .long("acquisition-time")
                .value_parser(value_parser!(u64))
                .default_value("5")
                .help("Simulated acquisition time in ms"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_parser(value_parser!(u64))
                .default_value("0")
                .help("Seed for simulated measurement noise"),
        )
        .arg(
            Arg::new("no-pause")
                .long("no-pause")
                .action(ArgAction::SetTrue)
                .help("Exit without waiting for Enter"),
        )
        .arg(
            Arg::new("high-priority")
                .long("high-priority")
                .action(ArgAction::SetTrue)
                .help("Run the measurement loop at maximum thread priority"),
        )
        .get_matches();

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => MeasurementConfig::from_file(path)?,
        None => MeasurementConfig::default(),
    };
    if let Some(resource) = matches.get_one::<String>("resource") {
        config.resource_name = resource.clone();
    }
    if let Some(iterations) = matches.get_one::<usize>("iterations") {
        config.iterations = *iterations;
    }
    if let Some(direction) = matches.get_one::<String>("link-direction") {
        config.carrier.link_direction = match direction.as_str() {
            "downlink" => LinkDirection::Downlink,
            _ => LinkDirection::Uplink,
        };
    }
    config.validate()?;

    let behavior = SimBehavior {
        acquisition_time: Duration::from_millis(*matches.get_one::<u64>("acquisition-time").unwrap()),
        seed: *matches.get_one::<u64>("seed").unwrap(),
        record_calls: false,
        ..Default::default()
    };

    if matches.get_flag("high-priority") {
        if let Err(err) = set_current_thread_priority(ThreadPriority::Max) {
            log::warn!("could not raise thread priority: {:?}", err);
        }
    }

    log::info!(
        "{:?} carrier at {} Hz on {}, {} iterations",
        config.carrier.link_direction,
        config.rf.center_frequency,
        config.resource_name,
        config.iterations
    );

    let control = RunControl::default();
    let stop = control.stop.clone();
    ctrlc::set_handler(move || {
        if stop.load(Ordering::Relaxed) {
            eprintln!("Killing...");
            exit(-1);
        }
        eprintln!("Stopping before the next iteration...");
        stop.store(true, Ordering::Relaxed);
    })?;

    let status = StatusLine::new(Progress {
        completed: control.completed.clone(),
        last_cycle_micros: control.last_cycle_micros.clone(),
        total: config.iterations,
    });
    let outcome = Orchestrator::new(config, SimDriver::new(behavior)).execute(&control);
    drop(status);

    let mut out = io::stdout().lock();
    match &outcome.result {
        Ok(summary) => report::write_summary(&mut out, summary)?,
        Err(err) => report::write_error(&mut out, err)?,
    }
    for err in &outcome.teardown_errors {
        report::write_error(&mut out, err)?;
    }
    writeln!(
        out,
        "\nFinished at {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    drop(out);

    if !matches.get_flag("no-pause") && io::stdin().is_terminal() {
        println!("\nPress Enter to exit");
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
    }

    if outcome.result.is_err() {
        exit(1);
    }
    Ok(())
}
