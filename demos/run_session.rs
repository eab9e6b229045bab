// Run one coordinated experiment
//
// Cameras and the DAQ are simulated; the stimulus microcontroller is real
// unless --no-micro is given.

use clap::Parser;
use mouse_house::sim::{SyntheticCamera, SyntheticDaq};
use mouse_house::{Hardware, PortOpener, Session, Settings, UiEvent};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "run_session")]
#[command(version = "1.0")]
#[command(about = "Start, record and stop every configured device together")]
struct Args {
    /// Experiment name, appended to the timestamped file name
    name: String,

    /// Settings file (TOML); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the run duration in milliseconds
    #[arg(short, long)]
    duration_ms: Option<u32>,

    /// Override the save directory
    #[arg(short, long)]
    save_dir: Option<PathBuf>,

    /// Run without the stimulus microcontroller
    #[arg(long)]
    no_micro: bool,

    /// Stop the run early after this many milliseconds
    #[arg(long)]
    hardstop_after_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    #[cfg(feature = "cpu-profiling")]
    let _tracy = tracy_client::Client::start();

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(ms) = args.duration_ms {
        settings.total_duration_ms = ms;
    }
    if let Some(dir) = args.save_dir {
        settings.save_dir = dir;
    }
    if args.no_micro {
        settings.microcontroller = None;
    }

    let (width, height) = (settings.display.frame_width as u32, settings.display.frame_height as u32);
    let hardware = Hardware {
        cameras: settings
            .cameras
            .iter()
            .map(|_| SyntheticCamera::new(width, height))
            .collect(),
        daq: Some(SyntheticDaq::new()),
        microcontroller: settings
            .microcontroller
            .as_ref()
            .map(|m| PortOpener::new(m.last_port.clone(), m.baud_rate)),
    };

    println!("Mouse House");
    println!("===========");
    println!("Cameras: {}", settings.cameras.len());
    println!("DAQ: {:?}", settings.daq.as_ref().map(|d| &d.channels));
    println!("Stimulus: {}", if settings.microcontroller.is_some() { "yes" } else { "no" });
    println!("Duration: {} ms", settings.effective_duration_ms());
    println!("Saving to: {}\n", settings.save_dir.display());

    let session = Session::start(&settings, hardware)?;
    // Give the workers a moment to open their hardware
    std::thread::sleep(Duration::from_millis(500));
    session.run_experiment(&args.name);

    let started = Instant::now();
    let limit = Duration::from_millis(u64::from(settings.effective_duration_ms())) + Duration::from_secs(30);
    let mut stopped = false;
    while started.elapsed() < limit {
        if let Some(after) = args.hardstop_after_ms {
            if !stopped && started.elapsed() >= Duration::from_millis(after) {
                println!("Hard stop");
                session.hardstop();
                stopped = true;
            }
        }
        match session.next_event(Duration::from_millis(100)) {
            Some(UiEvent::Started { run, save_file_name }) => {
                println!("✓ {} started: {}", run, save_file_name);
            }
            Some(UiEvent::Finished(outcome)) => {
                println!("✓ Finished: {:?} after {:.1}s", outcome, started.elapsed().as_secs_f64());
                break;
            }
            Some(UiEvent::FailedInit(reason)) => {
                eprintln!("Could not start: {}", reason);
                break;
            }
            Some(UiEvent::DeviceError(device)) => eprintln!("Device error: {}", device),
            Some(other) => println!("{:?}", other),
            None => {}
        }
    }

    for (id, buffer) in &session.displays().cameras {
        println!("{}: {} frames displayed", id, buffer.write_count());
    }
    if let Some(daq) = &session.displays().daq {
        println!("daq: {} traces displayed", daq.write_count());
    }

    session.shutdown();
    Ok(())
}
