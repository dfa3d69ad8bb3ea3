use anyhow::Result;
use log::Record;
use std::{fmt::Arguments, fs::OpenOptions, io::Write};

use crate::InputFile;

/// Somewhere a log line about one job can be appended, besides the global logger.
pub trait LogSink {
    fn append_line(self, message: Arguments) -> Result<()>;
}

impl LogSink for &InputFile {
    fn append_line(self, message: Arguments) -> Result<()> {
        if let Some(ref log_path) = self.log_path {
            self.create_log_directory()?;
            let mut file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_path)?;
            file.write_fmt(message)?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! job_debug {
    ($dest:expr, $($fmt:tt)*) => {{
        $crate::job_log!(log::Level::Debug, $dest, $($fmt)*)
    }};
}
/// Like `log::info!`, but the first argument is the `&InputFile` the message is about. The line
/// also goes to that file's log, if it has one.
#[macro_export]
macro_rules! job_info {
    ($dest:expr, $($fmt:tt)*) => {{
        $crate::job_log!(log::Level::Info, $dest, $($fmt)*)
    }};
}
#[macro_export]
macro_rules! job_warn {
    ($dest:expr, $($fmt:tt)*) => {{
        $crate::job_log!(log::Level::Warn, $dest, $($fmt)*)
    }};
}

/// Shared by the `job_*!` macros. The per-file copy is written regardless of the global log
/// level, so the file always has the full story of one encode.
#[macro_export]
macro_rules! job_log {
    ($level: expr, $dest:expr, $($fmt:tt)*) => {{
        $crate::logger::log_to_sink(
            $level,
            module_path!(),
            file!(),
            line!(),
            $dest,
            format_args!($($fmt)*),
        )
    }};
}

#[doc(hidden)]
pub fn log_to_sink<T>(
    level: log::Level,
    module_path: &'static str,
    file: &'static str,
    line: u32,
    dest: T,
    message: Arguments,
) where
    T: LogSink,
{
    let record = Record::builder()
        .args(message)
        .level(level)
        .target(module_path)
        .module_path_static(Some(module_path))
        .file_static(Some(file))
        .line(Some(line))
        .build();
    log::logger().log(&record);
    if let Err(err) = dest.append_line(message) {
        log::warn!("Could not write to the job log: {}", err);
    }
}
