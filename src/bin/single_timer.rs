//! One timer carrying an integer payload back through its notification.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sigtimer::{ClockSource, Interval, RegistryConfig, Stop, TimerRegistry};

#[derive(Clone, Copy, ValueEnum)]
enum Clock {
    Realtime,
    Monotonic,
}

impl From<Clock> for ClockSource {
    fn from(clock: Clock) -> Self {
        match clock {
            Clock::Realtime => ClockSource::Realtime,
            Clock::Monotonic => ClockSource::Monotonic,
        }
    }
}

#[derive(Parser)]
#[command(about = "Arm one timer and print the value it delivers")]
struct Args {
    /// Initial expiration and optional interval
    #[arg(default_value = "5:2", value_name = "secs[/nsecs][:int-secs[/int-nsecs]]")]
    spec: Interval,
    /// Value handed back with every expiration
    #[arg(long, default_value_t = 1234)]
    value: i32,
    #[arg(long, value_enum, default_value_t = Clock::Realtime)]
    clock: Clock,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = RegistryConfig::new().clock(args.clock.into());
    let registry = TimerRegistry::<i32>::new(config)
        .on_expiration(|record, event| {
            println!("Timer expired! Signal received: {}", event.signal());
            println!("Value delivered: {}", record.payload());
        })
        .build()
        .context("failed to set up timer registry")?;

    registry
        .arm(args.spec, args.value)
        .with_context(|| format!("failed to arm timer {}", args.spec))?;
    println!("Timer set. Waiting for signal...");

    match registry.dispatcher().run_until_idle()? {
        Stop::Idle => println!("Program exiting."),
        Stop::Terminated(signal) => log::info!("Terminated by signal {signal}"),
    }
    registry.shutdown()?;
    Ok(())
}
