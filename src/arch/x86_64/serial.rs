//! COM1 serial output

use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};

const COM1: u16 = 0x3F8;

/// Line status: transmit holding register empty
const LSR_THRE: u8 = 0x20;

static READY: AtomicBool = AtomicBool::new(false);

pub fn inb(port: u16) -> u8 {
    let value: u8;
    unsafe {
        asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack));
    }
    value
}

pub fn outb(port: u16, value: u8) {
    unsafe {
        asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack));
    }
}

/// 115200 baud, 8N1, FIFOs on
pub fn init() {
    outb(COM1 + 1, 0x00);
    outb(COM1 + 3, 0x80);
    outb(COM1, 0x01);
    outb(COM1 + 1, 0x00);
    outb(COM1 + 3, 0x03);
    outb(COM1 + 2, 0xC7);
    outb(COM1 + 4, 0x0B);
    READY.store(true, Ordering::Release);
}

pub fn write_byte(byte: u8) {
    if !READY.load(Ordering::Acquire) {
        init();
    }
    while inb(COM1 + 5) & LSR_THRE == 0 {
        core::hint::spin_loop();
    }
    outb(COM1, byte);
}
