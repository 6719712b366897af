/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: log                                                             ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Logger implementation. Messages go through a lock-free queue    ║
   ║         once the heap is up and directly to the serial port before      ║
   ║         that.                                                           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland & Niklas Sombert, HHU                            ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::allocator;
use crate::device::cpu;
use crate::device::lapic;
use crate::device::serial;
use crate::device::serial::{ComPort, SerialPort};
use alloc::string::{String, ToString};
use core::fmt::Write;
use log::{Level, LevelFilter, Metadata, Record};
use spin::{Mutex, Once};
use thingbuf::recycling::WithCapacity;
use thingbuf::ThingBuf;

mod ansi {
    pub const FOREGROUND_CYAN: &str = "\x1b[36m";
    pub const FOREGROUND_MAGENTA: &str = "\x1b[35m";
    pub const FOREGROUND_DEFAULT: &str = "\x1b[39m";
    pub const FOREGROUND_BRIGHT_WHITE: &str = "\x1b[97m";
    pub const FOREGROUND_BRIGHT_GREEN: &str = "\x1b[92m";
    pub const FOREGROUND_BRIGHT_BLUE: &str = "\x1b[94m";
    pub const FOREGROUND_BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const FOREGROUND_BRIGHT_RED: &str = "\x1b[91m";
}

pub struct Logger {
    level: Level,
    /// The queue messages are placed into. Lock-free and without further
    /// heap allocations after its creation.
    queue: Once<ThingBuf<String, WithCapacity>>,
    /// Before the heap exists, text goes directly to the serial port.
    serial: Once<Option<SerialPort>>,
    sink: Mutex<()>,
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = record.metadata().level();
        let file = record.file().unwrap_or("unknown").split('/').next_back().unwrap_or("unknown");
        let line = record.line().unwrap_or(0);

        if let Some(queue) = self.queue.get() {
            let systime = systime_ms();
            let seconds = systime / 1000;
            let fraction = systime % 1000;

            if let Ok(mut slot) = queue.push_ref() {
                // this doesn't allocate outside of the string
                let _ = write!(
                    *slot,
                    "{}[{}.{:0>3}]{}[{}]{}[{}@{:0>3}]{} {}\n",
                    ansi::FOREGROUND_CYAN, seconds, fraction, ansi_color(level),
                    level_token(level), ansi::FOREGROUND_MAGENTA, file, line,
                    ansi::FOREGROUND_DEFAULT, record.args()
                );
            }
            // if the queue is full, the message is silently dropped

            if let Some(_sink) = self.sink.try_lock() {
                while let Some(message) = queue.pop_ref() {
                    self.write_serial(message.as_str());
                }
            }
        } else {
            // very early boot; there might not even be a heap yet
            self.write_serial(ansi::FOREGROUND_CYAN);
            self.write_serial("[0.000]");
            self.write_serial(ansi_color(level));
            self.write_serial("[");
            self.write_serial(level_token(level));
            self.write_serial("]");
            self.write_serial(ansi::FOREGROUND_MAGENTA);
            self.write_serial("[");
            self.write_serial(file);
            self.write_serial("] ");
            self.write_serial(ansi::FOREGROUND_DEFAULT);

            if allocator().is_initialized() {
                self.write_serial(record.args().to_string().as_str());
            } else {
                self.write_serial(record.args().as_str().unwrap_or("Formatted messages are not supported before heap initialization!"));
            }

            self.write_serial("\n");
        }
    }

    fn flush(&self) {}
}

impl Logger {
    pub const fn new() -> Self {
        Self {
            level: Level::Debug,
            queue: Once::new(),
            serial: Once::new(),
            sink: Mutex::new(()),
        }
    }

    /// Probe the COM ports and install the logger into the log facade.
    pub fn init(&'static self) {
        self.serial.call_once(|| {
            let port = if serial::check_port(ComPort::Com1) {
                Some(SerialPort::new(ComPort::Com1))
            } else if serial::check_port(ComPort::Com2) {
                Some(SerialPort::new(ComPort::Com2))
            } else {
                None
            };

            if let Some(serial) = &port {
                serial.init();
            }
            port
        });

        let _ = log::set_logger(self);
        log::set_max_level(LevelFilter::Debug);
    }

    /// Switch to queued operation once the heap is available.
    pub fn enable_queue(&self) {
        self.queue.call_once(|| {
            // fill the buffer with a fixed number of fixed-size strings
            const MESSAGE_LENGTH: usize = 1024;
            const BUFFER_SIZE: usize = 32;

            let recycle = WithCapacity::new().with_min_capacity(MESSAGE_LENGTH);
            let buf = ThingBuf::with_recycle(BUFFER_SIZE, recycle);

            // pre-allocate the strings
            while let Ok(_) = buf.push_ref() {}
            while let Some(_) = buf.pop_ref() {}
            buf
        });
    }

    fn write_serial(&self, string: &str) {
        if let Some(Some(serial)) = self.serial.get() {
            serial.write_str(string);
        }
    }
}

/// Milliseconds since boot, derived from the TSC.
fn systime_ms() -> u64 {
    cpu::rdtsc() / lapic::freq_khz().max(1)
}

fn ansi_color(level: Level) -> &'static str {
    match level {
        Level::Trace => ansi::FOREGROUND_BRIGHT_WHITE,
        Level::Debug => ansi::FOREGROUND_BRIGHT_GREEN,
        Level::Info => ansi::FOREGROUND_BRIGHT_BLUE,
        Level::Warn => ansi::FOREGROUND_BRIGHT_YELLOW,
        Level::Error => ansi::FOREGROUND_BRIGHT_RED,
    }
}

fn level_token(level: Level) -> &'static str {
    match level {
        Level::Trace => "TRC",
        Level::Debug => "DBG",
        Level::Info => "INF",
        Level::Warn => "WRN",
        Level::Error => "ERR",
    }
}
