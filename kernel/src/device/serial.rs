/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: serial                                                          ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Write-only COM port driver, used as the log sink.               ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use x86_64::instructions::port::Port;

#[allow(dead_code)]
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u16)]
pub enum ComPort {
    Com1 = 0x3f8,
    Com2 = 0x2f8,
    Com3 = 0x3e8,
    Com4 = 0x2e8,
}

/// Check if a COM port exists by writing to its scratch register.
pub fn check_port(port: ComPort) -> bool {
    let mut scratch = Port::<u8>::new(port as u16 + 7);

    unsafe {
        scratch.write(0xae);
        scratch.read() == 0xae
    }
}

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    pub const fn new(port: ComPort) -> Self {
        Self { base: port as u16 }
    }

    /// Program 115200 baud, 8N1, no interrupts.
    pub fn init(&self) {
        let mut interrupt = Port::<u8>::new(self.base + 1);
        let mut fifo = Port::<u8>::new(self.base + 2);
        let mut line = Port::<u8>::new(self.base + 3);
        let mut modem = Port::<u8>::new(self.base + 4);
        let mut data = Port::<u8>::new(self.base);

        unsafe {
            interrupt.write(0x00);
            line.write(0x80); // enable divisor latch
            data.write(0x01); // divisor 1 = 115200 baud
            interrupt.write(0x00);
            line.write(0x03); // 8 bits, no parity, one stop bit
            fifo.write(0xc7);
            modem.write(0x0b);
        }
    }

    pub fn write_byte(&self, byte: u8) {
        let mut line_status = Port::<u8>::new(self.base + 5);
        let mut data = Port::<u8>::new(self.base);

        unsafe {
            while line_status.read() & 0x20 == 0 {}
            data.write(byte);
        }
    }

    pub fn write_str(&self, string: &str) {
        for byte in string.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}
