//! A stderr logger for interactive runs.

use std::time::SystemTime;

use log::{Level, LevelFilter, Metadata, Record};
use nu_ansi_term::{Color, Style};

/// Writes one level-colored line per record, like
///
/// ```text
/// 2026-08-01T12:03:07Z  info fscp::server: session established
/// ```
pub struct Logger;

impl Logger {
	/// Install as the global `log` sink. `level` caps what gets written;
	/// the engine logs its per-datagram drops at trace, so `Debug` is the
	/// sensible ceiling for interactive use.
	pub fn install(level: LevelFilter) {
		if log::set_logger(&Logger).is_ok() {
			log::set_max_level(level);
		}
	}
}

impl log::Log for Logger {
	fn enabled(&self, metadata: &Metadata) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let level = match record.level() {
			Level::Error => Color::Red.bold().paint("error"),
			Level::Warn => Color::Yellow.bold().paint(" warn"),
			Level::Info => Color::Green.bold().paint(" info"),
			Level::Debug => Color::Blue.bold().paint("debug"),
			Level::Trace => Color::Purple.bold().paint("trace"),
		};

		let dim = Style::new().dimmed();
		let time = humantime::format_rfc3339_seconds(SystemTime::now());

		eprintln!(
			"{} {level} {}: {}",
			dim.paint(time.to_string()),
			Style::new().bold().paint(record.target()),
			record.args()
		);
	}

	fn flush(&self) {}
}
