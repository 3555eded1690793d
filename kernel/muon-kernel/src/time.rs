//! System time.
//!
//! A single monotone microsecond counter, advanced by whichever timer
//! source is live: the PIT at boot, the calibrated LAPIC timer once the
//! APIC routing is up. Every advance drives the scheduler.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86::pit;
use crate::irq::IrqContext;

/// Microseconds since boot. Strictly monotone.
static TICK: AtomicU64 = AtomicU64::new(0);

/// Microseconds added per LAPIC timer fire (set by calibration).
static LAPIC_PERIOD_US: AtomicU64 = AtomicU64::new(0);

/// Current tick value.
#[inline]
pub fn tick() -> u64 {
    TICK.load(Ordering::Relaxed)
}

/// Advances the clock by `delta_us` and gives the scheduler its tick.
/// Called from timer interrupt handlers.
pub fn timer_handler(delta_us: u64) {
    TICK.fetch_add(delta_us, Ordering::Relaxed);
    crate::sched::on_tick();
}

/// PIT (IRQ 0) tick entry.
pub fn pit_tick(_irq: u8, _ctx: &mut IrqContext) {
    timer_handler(pit::TICK_US);
}

/// LAPIC timer tick entry.
pub fn lapic_tick(_ctx: &mut IrqContext) {
    timer_handler(LAPIC_PERIOD_US.load(Ordering::Relaxed));
}

/// Switches the tick source to the LAPIC timer: calibrates it against
/// the PIT-driven clock, starts it periodic, and silences the PIT line.
///
/// Calibration samples the PIT-driven tick, so interrupts are enabled
/// for its duration even when called from the (otherwise interrupt-free)
/// boot path.
pub fn adopt_lapic_timer() {
    use crate::arch::x86::instructions::interrupts;

    let were_enabled = interrupts::are_enabled();
    if !were_enabled {
        // SAFETY: The IDT, routing core, and PIT tick are live by the
        // time the LAPIC timer is adopted.
        unsafe { interrupts::enable() };
    }
    let calibration = crate::interrupts::with_lapic(|lapic| lapic.calibrate_timer());
    if !were_enabled {
        interrupts::disable();
    }
    let Some(calibration) = calibration else {
        return;
    };
    LAPIC_PERIOD_US.store(u64::from(calibration.period_us), Ordering::Relaxed);
    crate::interrupts::with_lapic(|lapic| {
        lapic.enable_timer(crate::interrupts::LAPIC_TIMER_VECTOR, calibration);
    });
    // The PIT keeps counting but its interrupt is no longer needed.
    crate::interrupts::mask(0);
    crate::kinfo!(
        "time: LAPIC timer {} us/fire (initial count {})",
        calibration.period_us,
        calibration.initial_count
    );
}

/// Delays the calling task for at least `us` microseconds, yielding the
/// CPU while waiting.
pub fn delay_us(us: u64) {
    let deadline = tick() + us;
    while tick() < deadline {
        crate::sched::yield_cooperative();
    }
}

/// Delays the calling task for at least `ms` milliseconds.
pub fn delay_ms(ms: u64) {
    delay_us(ms * 1000);
}
