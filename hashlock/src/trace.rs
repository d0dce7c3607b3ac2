use log::LevelFilter;
use tracing::{info, subscriber};
use tracing_subscriber::{filter::LevelFilter as TracingLevel, FmtSubscriber};

pub fn init_tracing(level: LevelFilter) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing_level(level))
        .finish();

    subscriber::set_global_default(subscriber)?;
    info!("Initialized tracing with level: {}", level);

    Ok(())
}

fn tracing_level(level: LevelFilter) -> TracingLevel {
    match level {
        LevelFilter::Off => TracingLevel::OFF,
        LevelFilter::Error => TracingLevel::ERROR,
        LevelFilter::Warn => TracingLevel::WARN,
        LevelFilter::Info => TracingLevel::INFO,
        LevelFilter::Debug => TracingLevel::DEBUG,
        LevelFilter::Trace => TracingLevel::TRACE,
    }
}
