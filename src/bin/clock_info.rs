use anyhow::Result;
use chrono::{Local, TimeZone};
use sigtimer::ClockSource;

fn main() -> Result<()> {
    env_logger::init();

    let now = ClockSource::Realtime.now()?;
    let res = ClockSource::Realtime.resolution()?;
    let local = Local
        .timestamp_opt(now.as_secs() as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    println!("Real-time: {}.{:09}", local, now.subsec_nanos());
    println!(
        "Real-time resolution: {} seconds, {} nanoseconds",
        res.as_secs(),
        res.subsec_nanos()
    );

    let now = ClockSource::Monotonic.now()?;
    let res = ClockSource::Monotonic.resolution()?;
    println!("Monotonic: {} seconds since boot", now.as_secs());
    println!(
        "Monotonic resolution: {} seconds, {} nanoseconds",
        res.as_secs(),
        res.subsec_nanos()
    );
    Ok(())
}
