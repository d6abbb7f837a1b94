use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use cashell::{
    Config, Session, Severity,
    dbr::{DbrType, DbrValue},
    loopback::LoopbackContext,
};
use clap::Parser;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Options {
    /// PV names to serve and monitor
    #[clap(id = "PV_NAME", default_values_t = ["DEMO:COUNTER".to_string(), "DEMO:RAMP".to_string()])]
    names: Vec<String>,
    /// Timeout for each blocking call, in seconds
    #[clap(short, default_value_t = 2.0)]
    timeout: f64,
    /// Also read the first PV as this DBR type, e.g. DBR_TIME_STRING
    #[clap(short = 'd', id = "DBR_TYPE")]
    dbr_type: Option<DbrType>,
    /// Number of monitor updates to print before exiting
    #[clap(short = 'n', default_value_t = 10)]
    updates: usize,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::default().add_directive(
                match opts.verbose {
                    0 => LevelFilter::INFO,
                    1 => LevelFilter::DEBUG,
                    2.. => LevelFilter::TRACE,
                }
                .into(),
            ),
        )
        .init();

    let config = Config::from_env().timeout(Duration::from_secs_f64(opts.timeout));
    let context = LoopbackContext::with_config(&config).unwrap();
    let pvs: Vec<_> = opts
        .names
        .iter()
        .map(|name| context.add_pv(name, 0.0f64).unwrap())
        .collect();
    context.add_pv("DEMO:SETPOINT", 0.0f64).unwrap();

    // Tick every served PV in the background
    let running = Arc::new(AtomicBool::new(true));
    let ticker = {
        let running = running.clone();
        let pvs = pvs.clone();
        thread::spawn(move || {
            let mut tick = 0u32;
            while running.load(Ordering::Relaxed) {
                tick += 1;
                for (i, pv) in pvs.iter().enumerate() {
                    let _ = pv.store(f64::from(tick) * (i + 1) as f64);
                    pv.set_severity(if tick % 5 == 0 {
                        Severity::Minor
                    } else {
                        Severity::NoAlarm
                    });
                }
                thread::sleep(Duration::from_millis(250));
            }
        })
    };

    let session = Session::with_config(context.clone(), &config);
    info!("{}", session.info());

    let mut names = opts.names.clone();
    names.push("DEMO:MISSING".to_string());
    match session.read_many(&names) {
        Ok(readings) => {
            for (name, reading) in names.iter().zip(readings) {
                match reading {
                    Some(envelope) => println!("{name}: {envelope}"),
                    None => println!("{name}: <timed out>"),
                }
            }
        }
        Err(e) => warn!("Batch read failed: {e}"),
    }

    if let (Some(dbr_type), Some(name)) = (opts.dbr_type, opts.names.first()) {
        match session.fetch(name, Some(dbr_type), None) {
            Ok(envelope) => println!("{name} as {dbr_type}: {envelope}"),
            Err(e) => warn!("Read of {name} as {dbr_type} failed: {e}"),
        }
    }

    match session.write("DEMO:SETPOINT", "42.5", true) {
        Ok(()) => match session.read_value("DEMO:SETPOINT") {
            Ok(value) => println!("DEMO:SETPOINT <- {value}"),
            Err(e) => warn!("Read back failed: {e}"),
        },
        Err(e) => warn!("Write failed: {e}"),
    }

    let monitors: Vec<_> = opts
        .names
        .iter()
        .filter_map(|name| match session.monitor(name) {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                warn!("Could not monitor {name}: {e}");
                None
            }
        })
        .collect();
    for monitor in &monitors {
        monitor.set_capacity(4);
        let name = monitor.name().to_owned();
        monitor.add_listener(move |envelope| {
            if envelope.severity() != Severity::NoAlarm {
                info!("{name} in alarm: {}", envelope.severity());
            }
        });
    }

    let mut printed = 0;
    while printed < opts.updates && !monitors.is_empty() {
        for monitor in &monitors {
            if let Some(envelope) = monitor.wait() {
                let display = match envelope.value() {
                    DbrValue::Double(v) if v.len() == 1 => format!("{:.1}", v[0]),
                    other => other.to_string(),
                };
                println!("{} {} {}", monitor.name(), display, envelope.severity());
                printed += 1;
            }
        }
    }

    for monitor in monitors {
        monitor.close();
    }
    session.close();
    running.store(false, Ordering::Relaxed);
    let _ = ticker.join();
    info!("Done, {:?}", context.stats());
}
