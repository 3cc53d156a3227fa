//! Logging backend for the `log` facade.
//!
//! Level tags go to stderr, colored through `anstyle`. The level is taken
//! from the `DIAG_LOG` environment variable (`error`, `warn`, `info`,
//! `debug`, `trace`), defaulting to `info`.

use anstyle::AnsiColor;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct RouterLogger;

static LOGGER: RouterLogger = RouterLogger;

pub fn init() {
	let level = std::env::var("DIAG_LOG")
		.ok()
		.and_then(|value| value.parse().ok())
		.unwrap_or(LevelFilter::Info);

	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(level);
	}
}

impl Log for RouterLogger {
	fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
		true
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let color = match record.level() {
			Level::Error => AnsiColor::Red,
			Level::Warn => AnsiColor::Yellow,
			Level::Info => AnsiColor::Green,
			Level::Debug => AnsiColor::Cyan,
			Level::Trace => AnsiColor::Magenta,
		};
		let style = color.on_default().bold();

		eprintln!("[{style}{:>5}{style:#}] {}", record.level(), record.args());
	}

	fn flush(&self) {}
}
