//! 8253/8254 Programmable Interval Timer.
//!
//! The boot tick source: channel 0 in rate-generator mode at 1 kHz,
//! feeding the system tick until (and alongside, if the APIC is off) the
//! calibrated LAPIC timer.

use crate::arch::x86::instructions::port::Port;

const CH0_DATA: Port<u8> = Port::new(0x40);
const MODE_CMD: Port<u8> = Port::new(0x43);

/// PIT input clock in Hz.
const PIT_HZ: u32 = 1_193_182;

/// Programmed tick rate.
pub const TICK_HZ: u32 = 1000;

/// Microseconds per PIT tick at [`TICK_HZ`].
pub const TICK_US: u64 = 1_000_000 / TICK_HZ as u64;

/// Channel 0, lobyte/hibyte access, mode 2 (rate generator).
const CMD_CH0_RATE: u8 = 0b0011_0100;

/// Programs channel 0 for [`TICK_HZ`] interrupts on IRQ 0.
///
/// # Safety
///
/// Must be called with interrupts disabled; the IRQ 0 handler must be
/// registered before the line is unmasked.
pub unsafe fn init() {
    let divisor = (PIT_HZ / TICK_HZ) as u16;
    // SAFETY: The standard channel-0 programming sequence.
    unsafe {
        MODE_CMD.write(CMD_CH0_RATE);
        CH0_DATA.write(divisor as u8);
        CH0_DATA.write((divisor >> 8) as u8);
    }
}
