use clap::Parser;
use combigrid::logger;
use combigrid::third_level::mediator::Mediator;
use std::time::Duration;

/// Pairs two system instances for the third-level combination and bridges
/// their sparse-grid byte streams.
#[derive(Parser)]
#[command(name = "third-level-mediator")]
struct Args {
    /// Address of the control channel listener
    #[arg(long, default_value = "0.0.0.0:9998")]
    control: String,

    /// Address of the data channel listener
    #[arg(long, default_value = "0.0.0.0:9999")]
    data: String,

    /// Seconds of inactivity after which a channel is considered dead
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

fn main() {
    logger::init();
    let args = Args::parse();

    let mediator = match Mediator::bind(&args.control, &args.data, Duration::from_secs(args.timeout_secs)) {
        Ok(m) => m,
        Err(e) => {
            log::error!("could not bind mediator: {}", e);
            std::process::exit(1);
        }
    };
    log::info!(
        "mediator listening, control on {}, data on {}",
        args.control,
        args.data
    );
    if let Err(e) = mediator.run() {
        log::error!("mediator stopped: {}", e);
        std::process::exit(1);
    }
}
