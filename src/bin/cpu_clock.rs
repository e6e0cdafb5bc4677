use anyhow::{Context, Result};
use clap::Parser;
use sigtimer::clock::CpuClock;

#[derive(Parser)]
#[command(about = "Read the CPU-time clock of a process")]
struct Args {
    #[arg(value_name = "process-ID")]
    pid: libc::pid_t,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let clock = CpuClock::for_pid(args.pid)
        .with_context(|| format!("no CPU-time clock for PID {}", args.pid))?;
    println!("Clock ID for PID {}: {}", args.pid, clock.clock_id());

    let ts = clock.now()?;
    println!(
        "CPU-time clock for PID {} is {}.{:09} seconds",
        args.pid,
        ts.as_secs(),
        ts.subsec_nanos()
    );
    Ok(())
}
