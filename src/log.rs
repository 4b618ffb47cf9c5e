use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::{
    collections::HashMap,
    env,
    fs::{File, OpenOptions},
    io,
    io::{BufWriter, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    // Possibly buffered.
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let mut f: Box<dyn Write + Send> = if let Ok(filename) = env::var("REWIND_LOG_FILE") {
            Box::new(File::create(&filename).unwrap())
        } else if let Ok(filename) = env::var("REWIND_APPEND_LOG_FILE") {
            Box::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&filename)
                    .unwrap(),
            )
        } else {
            Box::new(io::stderr())
        };

        if let Ok(buf_size) = env::var("REWIND_LOG_BUFFER") {
            let n = buf_size.parse::<usize>().unwrap();
            f = Box::new(BufWriter::with_capacity(n, f));
        }

        let mut default_level = LogWarn;
        let mut level_map: HashMap<String, LogLevel> = HashMap::new();
        if let Ok(spec) = env::var("REWIND_LOG") {
            for clause in spec.split(',') {
                let mut it = clause.splitn(2, '=');
                let name = it.next().unwrap_or("").trim();
                let level = match it.next().map(|l| l.trim()) {
                    Some("fatal") => LogFatal,
                    Some("error") => LogError,
                    Some("warn") => LogWarn,
                    Some("info") => LogInfo,
                    Some("debug") | None => LogDebug,
                    Some(_) => LogWarn,
                };
                if name == "all" || name.is_empty() {
                    default_level = level;
                } else {
                    level_map.insert(name.to_owned(), level);
                }
            }
        }

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file: f,
            default_level,
        })
    };
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // Filenames are case sensitive on Linux; no case folding here.
    match l.level_map.get(module_name) {
        Some(level) => *level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(m) = l.log_modules_cache.get(filename) {
        return m.to_owned();
    }
    let name = filename_to_module_name(filename);
    let level = get_log_level(&name, l);
    let m = LogModule { level, name };
    l.log_modules_cache.insert(filename.to_owned(), m.clone());
    m
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// A log line under construction. The newline and the flush happen on drop,
/// while the global lock is still held, so lines from different call sites
/// never interleave.
pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        module_path: &str,
        always_enabled: bool,
    ) -> NewLineTerminatingOstream {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        let mut this = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if enabled {
            if level == LogDebug {
                write!(this, "[{}] ", m.name).unwrap();
            } else {
                write_prefix(&mut this, level, filename, line, module_path);
            }
        }
        this
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write_all(b"\n").unwrap();
            self.flush().unwrap();
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
            self.lock.log_file.flush()?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }
        // Pretend the bytes were written even when disabled, otherwise
        // write!() reports WriteZero.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
) {
    write!(stream, "[{} ", log_name(level)).unwrap();
    if level <= LogError {
        write!(stream, "{}:{} ", filename, line).unwrap();
    }
    write!(stream, "{}()", module_path).unwrap();
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> NewLineTerminatingOstream {
    NewLineTerminatingOstream::new(log_level, filename, line, module_path, always_enabled)
}

/// Write a leveled line to the log file (stderr when no log file was
/// configured), then continue normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use ::std::io::Write;
            let mut stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            write!(stream, $($args)+).unwrap()
        }
    };
}

/// Log at FATAL, dump a backtrace to stderr and abort.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use ::std::io::Write;
                use crate::log::LogFatal;
                let mut stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                write!(stream, $($args)+).unwrap();
            }
            crate::log::notifying_abort(backtrace::Backtrace::new())
        }
    };
}

/// Write to stderr and exit. No backtrace; for environment problems rather
/// than bugs.
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            use ::std::io::Write;
            use ::std::io::stderr;
            use crate::log::LogFatal;
            crate::log::write_prefix(&mut stderr(), LogFatal, file!(), line!(), module_path!());
            write!(stderr(), $($args)+).unwrap();
            write!(stderr(), "\n").unwrap();
            ::std::process::exit(1)
        }
    };
}

/// Assert a condition that must hold for the given task; on failure, report
/// the task's identity and wait status and abort with a backtrace.
macro_rules! ed_assert {
    ($task:expr, $cond:expr) => {
        {
            if !$cond {
                {
                    use ::std::io::Write;
                    use crate::log::LogFatal;
                    let t = &*$task;
                    let mut stream = crate::log::log(
                        LogFatal,
                        file!(),
                        line!(),
                        module_path!(),
                        true
                    );
                    write!(
                        stream,
                        "Assertion `{}' failed to hold (task {} (rec:{}) status: {})",
                        stringify!($cond), t.tid, t.rec_tid, t.wait_status,
                    ).unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new());
            }
        }
    };
    ($task:expr, $cond:expr, $($args:tt)+) => {
        {
            if !$cond {
                {
                    use ::std::io::Write;
                    use crate::log::LogFatal;
                    let t = &*$task;
                    let mut stream = crate::log::log(
                        LogFatal,
                        file!(),
                        line!(),
                        module_path!(),
                        true
                    );
                    write!(
                        stream,
                        "Assertion `{}' failed to hold (task {} (rec:{}) status: {}) ",
                        stringify!($cond), t.tid, t.rec_tid, t.wait_status,
                    ).unwrap();
                    write!(stream, $($args)+).unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new());
            }
        }
    };
}

macro_rules! ed_assert_eq {
    ($task:expr, $lhs:expr, $rhs:expr) => {
        ed_assert!($task, $lhs == $rhs)
    };
    ($task:expr, $lhs:expr, $rhs:expr, $($args:tt)+) => {
        ed_assert!($task, $lhs == $rhs, $($args)+)
    };
}

macro_rules! ed_assert_ne {
    ($task:expr, $lhs:expr, $rhs:expr) => {
        ed_assert!($task, $lhs != $rhs)
    };
    ($task:expr, $lhs:expr, $rhs:expr, $($args:tt)+) => {
        ed_assert!($task, $lhs != $rhs, $($args)+)
    };
}

/// Dump the backtrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    write!(io::stderr(), "=== Start rewind backtrace:\n").unwrap();
    write!(io::stderr(), "{:?}", bt).unwrap();
    write!(io::stderr(), "=== End rewind backtrace\n").unwrap();
    std::process::abort();
}
