use chrono::Local;
use fern::Dispatch;
use log::LevelFilter;

/// Initializes the global logger.
///
/// Should be called once at the very beginning of `main`. The log level is
/// controlled by the `RUST_LOG` environment variable and defaults to `info`.
/// Calling it twice is harmless; the second apply is ignored.
pub fn init() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_level_filter = log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);

    let colors = fern::colors::ColoredLevelConfig::new()
        .error(fern::colors::Color::Red)
        .warn(fern::colors::Color::Yellow)
        .info(fern::colors::Color::Green)
        .debug(fern::colors::Color::Blue)
        .trace(fern::colors::Color::BrightBlack);

    let result = Dispatch::new()
        .level(log_level_filter)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .chain(std::io::stderr())
        .apply();

    if let Err(e) = result {
        eprintln!("Failed to apply logger configuration: {}", e);
    }
}
