// Stimulus microcontroller discovery example
//
// Lists the serial ports on this machine, then looks for the board that
// greets with <ready>.

use clap::Parser;
use mouse_house::MicroConnector;

#[derive(Parser)]
#[command(name = "find_microcontroller")]
#[command(about = "Locate the stimulus microcontroller")]
struct Args {
    /// Port to try before all others
    #[arg(short, long)]
    last_port: Option<String>,

    #[arg(short, long, default_value_t = 115_200)]
    baud_rate: u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let devices = MicroConnector::get_available_devices()?;
    if devices.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }
    println!("Found {} port(s):", devices.len());
    for (i, device) in devices.iter().enumerate() {
        println!("  {}. {} at {}", i + 1, device.name, device.port);
    }

    println!("\nLooking for the microcontroller...");
    match MicroConnector::connect(args.last_port.as_deref(), args.baud_rate) {
        Ok((_link, port)) => println!("✓ Microcontroller ready on {}", port),
        Err(e) => println!("Not found: {}", e),
    }
    Ok(())
}
