//! Arms one signal-notified timer per command-line spec and reports every expiration.

use anyhow::{Context, Result};
use clap::Parser;
use sigtimer::{RegistryConfig, Stop, TimerRegistry, clock::format_now};

#[derive(Parser)]
#[command(about = "Create POSIX timers notified through SIGUSR1")]
struct Args {
    /// Timer specs, one timer each
    #[arg(required = true, value_name = "secs[/nsecs][:int-secs[/int-nsecs]]")]
    specs: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let registry = TimerRegistry::<usize>::new(RegistryConfig::new().signal(libc::SIGUSR1))
        .on_expiration(|record, event| {
            let now = format_now("%T").unwrap_or_default();
            println!("Received signal {} at {}", event.signal(), now);
            println!("Timer ID: {}", record.handle());
            println!("Overrun: {}", record.overrun_count());
        })
        .build()
        .context("failed to set up timer registry")?;

    let handles = registry
        .arm_specs(args.specs.as_slice(), |index, interval| {
            println!(
                "Setting timer with expiration: {} sec and {} nsec",
                interval.initial().as_secs(),
                interval.initial().subsec_nanos()
            );
            index
        })
        .context("failed to arm timers")?;
    for (index, handle) in handles.iter().enumerate() {
        println!("Timer {} created with ID: {}", index + 1, handle);
    }

    let stop = registry.dispatcher().run()?;
    if let Stop::Terminated(signal) = stop {
        log::info!("Terminated by signal {signal}");
    }
    registry.shutdown()?;
    Ok(())
}
