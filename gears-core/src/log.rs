pub use log::{trace, debug, info, warn, error, LevelFilter};

/// Install the global logger. `RUST_LOG` overrides `level` per module.
pub fn initialize(level: LevelFilter) -> Result<(), anyhow::Error> {
    env_logger::builder()
        .filter_level(level)
        .filter_module("gears_rhi::vulkan", log::LevelFilter::Info)
        .format_timestamp_micros()
        .parse_default_env()
        .try_init()?;

    Ok(())
}
