//! Panic handler
//!
//! Fatal kernel errors print a report on the console and stop the
//! processor with interrupts masked.

use core::fmt::{self, Display, Write};
use core::panic::{Location, PanicInfo};

use crate::arch::Platform;

/// Format the fatal error report
pub fn write_report(
    w: &mut impl Write,
    cpu: Option<usize>,
    location: Option<&Location<'_>>,
    message: impl Display,
) -> fmt::Result {
    writeln!(w)?;
    match cpu {
        Some(cpu) => writeln!(w, "!!! KERNEL PANIC on cpu{} !!!", cpu)?,
        None => writeln!(w, "!!! KERNEL PANIC !!!")?,
    }
    if let Some(location) = location {
        writeln!(w, "Location: {}:{}:{}", location.file(), location.line(), location.column())?;
    }
    writeln!(w, "Message: {}", message)?;
    writeln!(w, "System halted.")
}

/// Report a panic and halt. Without a platform (panic before boot
/// finished) the processor just spins.
pub fn kernel_panic(info: &PanicInfo, platform: Option<&dyn Platform>) -> ! {
    if let Some(platform) = platform {
        platform.disable_interrupts();
    }

    let cpu = platform.map(|p| p.cpu_id());
    let mut console = crate::console::panic_console();
    let _ = write_report(&mut *console, cpu, info.location(), info.message());
    drop(console);

    match platform {
        Some(platform) => platform.halt(),
        None => loop {
            core::hint::spin_loop();
        },
    }
}
