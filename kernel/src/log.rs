//! Kernel log
//!
//! Every line reads `[cpuN][pid=X][subsys][LEVEL] message`. Lines go to the
//! registered console, if any, and into a 64 KiB ring that keeps the most
//! recent whole lines for `read_log_buffer` (dmesg).
//!
//! The cpu and task in the prefix come from a `LogContext` registered by the
//! dispatch layer; until then the prefix reads `[cpu0][pid=0]`.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::{Mutex, Once};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_raw(raw: u8) -> Self {
        Self::ALL
            .get(raw as usize)
            .copied()
            .unwrap_or(LogLevel::Info)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most verbose level that is still emitted
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_log_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn log_level() -> LogLevel {
    LogLevel::from_raw(MAX_LEVEL.load(Ordering::Relaxed))
}

#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level <= log_level()
}

/// Where finished lines are written (the serial port on hardware)
pub trait Console: Sync {
    fn write_line(&self, line: &str);
}

/// Source of the `[cpuN][pid=X]` prefix
///
/// Implementations must not take scheduler locks: log lines are emitted
/// from inside scheduler critical sections.
pub trait LogContext: Sync {
    fn cpu_id(&self) -> usize;
    fn task_id(&self) -> Option<usize>;
}

static CONSOLE: Once<&'static dyn Console> = Once::new();
static CONTEXT: Once<&'static dyn LogContext> = Once::new();

/// Register the console. Only the first call takes effect.
pub fn set_console(console: &'static dyn Console) {
    CONSOLE.call_once(|| console);
}

/// Register the prefix source. Only the first call takes effect.
pub fn set_context(context: &'static dyn LogContext) {
    CONTEXT.call_once(|| context);
}

const RING_SIZE: usize = 64 * 1024;
const LINE_SIZE: usize = 512;

/// Byte ring of newline-terminated lines; the oldest lines are evicted
/// whole to make room
struct LogRing {
    bytes: [u8; RING_SIZE],
    head: usize,
    len: usize,
    lines: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            bytes: [0; RING_SIZE],
            head: 0,
            len: 0,
            lines: 0,
        }
    }

    fn push_line(&mut self, line: &str) {
        let needed = line.len() + 1;
        if needed > RING_SIZE {
            return;
        }
        while RING_SIZE - self.len < needed {
            self.evict_oldest();
        }
        for byte in line.bytes().chain(core::iter::once(b'\n')) {
            self.bytes[(self.head + self.len) % RING_SIZE] = byte;
            self.len += 1;
        }
        self.lines += 1;
    }

    fn evict_oldest(&mut self) {
        while self.len > 0 {
            let byte = self.bytes[self.head];
            self.head = (self.head + 1) % RING_SIZE;
            self.len -= 1;
            if byte == b'\n' {
                break;
            }
        }
        self.lines = self.lines.saturating_sub(1);
    }

    /// Copy the oldest bytes into `dest`
    fn copy_to(&self, dest: &mut [u8]) -> usize {
        let count = core::cmp::min(self.len, dest.len());
        let first = core::cmp::min(count, RING_SIZE - self.head);
        dest[..first].copy_from_slice(&self.bytes[self.head..self.head + first]);
        dest[first..count].copy_from_slice(&self.bytes[..count - first]);
        count
    }
}

static RING: Mutex<LogRing> = Mutex::new(LogRing::new());

/// Copy the retained log into `dest`, oldest line first. Returns the byte count.
pub fn read_log_buffer(dest: &mut [u8]) -> usize {
    RING.lock().copy_to(dest)
}

/// One formatted line; output beyond `LINE_SIZE` is dropped at a char boundary
struct Line {
    bytes: [u8; LINE_SIZE],
    len: usize,
}

impl Line {
    const fn new() -> Self {
        Self {
            bytes: [0; LINE_SIZE],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }
}

impl Write for Line {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_SIZE - self.len;
        let mut take = core::cmp::min(room, s.len());
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[doc(hidden)]
pub fn _log(level: LogLevel, subsys: &str, args: fmt::Arguments) {
    if !enabled(level) {
        return;
    }
    let (cpu, pid) = CONTEXT
        .get()
        .map(|context| (context.cpu_id(), context.task_id().unwrap_or(0)))
        .unwrap_or((0, 0));

    let mut line = Line::new();
    let _ = write!(line, "[cpu{}][pid={}][{}][{}] {}", cpu, pid, subsys, level, args);

    if let Some(console) = CONSOLE.get() {
        console.write_line(line.as_str());
    }
    RING.lock().push_line(line.as_str());
}

#[doc(hidden)]
#[macro_export]
macro_rules! __log_at {
    ($level:ident, $subsys:expr, $($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::$level, $subsys, format_args!($($arg)*))
    };
}

/// `log_error!("SUBSYS", "fmt", args..)`
#[macro_export]
macro_rules! log_error {
    ($subsys:expr, $($arg:tt)*) => { $crate::__log_at!(Error, $subsys, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($subsys:expr, $($arg:tt)*) => { $crate::__log_at!(Warn, $subsys, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($subsys:expr, $($arg:tt)*) => { $crate::__log_at!(Info, $subsys, $($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($subsys:expr, $($arg:tt)*) => { $crate::__log_at!(Debug, $subsys, $($arg)*) };
}

#[macro_export]
macro_rules! log_trace {
    ($subsys:expr, $($arg:tt)*) => { $crate::__log_at!(Trace, $subsys, $($arg)*) };
}
