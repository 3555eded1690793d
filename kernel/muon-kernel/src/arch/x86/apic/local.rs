//! Local APIC driver.
//!
//! Software enable via the spurious vector register, end-of-interrupt,
//! LINT/NMI wiring, and the timer with its calibration search.

use muon_core::addr::VirtAddr;

use crate::arch::x86::instructions::mmio;
use crate::config::SPURIOUS_VECTOR;
use crate::time;

// Register offsets from the LAPIC MMIO base.
const REG_ID: u32 = 0x020;
const REG_EOI: u32 = 0x0B0;
const REG_SPURIOUS: u32 = 0x0F0;
const REG_LVT_TIMER: u32 = 0x320;
const REG_LVT_LINT0: u32 = 0x350;
const REG_LVT_LINT1: u32 = 0x360;
const REG_TIMER_INITCNT: u32 = 0x380;
const REG_TIMER_CURCNT: u32 = 0x390;
const REG_TIMER_DIV: u32 = 0x3E0;

/// LVT mask bit.
const LVT_MASKED: u32 = 1 << 16;
/// LVT timer periodic mode.
const LVT_TIMER_PERIODIC: u32 = 1 << 17;
/// LVT delivery mode NMI.
const LVT_DELIVERY_NMI: u32 = 0b100 << 8;

/// Spurious register: APIC software enable.
const SPURIOUS_ENABLE: u32 = 1 << 8;

/// Timer divisor configuration value for divide-by-16.
const TIMER_DIV_16: u32 = 0b0011;

/// Sampling window for timer calibration, in ticks of the platform
/// timer (microseconds).
const CALIBRATE_DURATION_US: u64 = 10_000;

/// Calibration searches for a period in this range that minimizes the
/// fractional error of the initial count.
const PERIOD_SEARCH_US: (u32, u32) = (75, 150);

/// Result of [`LocalApic::calibrate_timer`].
#[derive(Debug, Clone, Copy)]
pub struct TimerCalibration {
    /// Initial-count value producing one fire per `period_us`.
    pub initial_count: u32,
    /// Microseconds represented by each timer fire.
    pub period_us: u32,
}

/// The bootstrap CPU's local APIC.
pub struct LocalApic {
    base: VirtAddr,
}

impl LocalApic {
    /// Creates a driver over a mapped register window.
    ///
    /// # Safety
    ///
    /// `base` must map the LAPIC MMIO page, cache-disabled.
    pub unsafe fn new(base: VirtAddr) -> Self {
        Self { base }
    }

    /// This CPU's APIC id.
    pub fn id(&self) -> u8 {
        (self.read(REG_ID) >> 24) as u8
    }

    /// Software-enables the APIC with the fixed spurious vector.
    pub fn enable(&self) {
        self.write(
            REG_SPURIOUS,
            u32::from(SPURIOUS_VECTOR) | SPURIOUS_ENABLE,
        );
    }

    /// Signals end-of-interrupt.
    #[inline]
    pub fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    /// Wires a LINT pin to NMI delivery.
    pub fn wire_lint_nmi(&self, lint: u8) {
        let reg = if lint == 0 { REG_LVT_LINT0 } else { REG_LVT_LINT1 };
        self.write(reg, LVT_DELIVERY_NMI);
    }

    /// Calibrates the timer against the platform tick.
    ///
    /// Runs the timer one-shot with the divisor set, counts APIC ticks
    /// across a fixed platform-timer window, then searches the bounded
    /// period range for the value whose initial count has the smallest
    /// fractional error, so each periodic fire advances the clock by an
    /// integer number of microseconds.
    pub fn calibrate_timer(&self) -> TimerCalibration {
        let lvt_orig = self.read(REG_LVT_TIMER);
        self.write(REG_TIMER_DIV, TIMER_DIV_16);
        // One-shot, masked out of the way on a spare vector.
        self.write(REG_LVT_TIMER, 0xFF);

        // Wait for a tick edge so the window is a whole number of ticks.
        let edge = time::tick();
        while time::tick() == edge {
            core::hint::spin_loop();
        }

        self.write(REG_TIMER_INITCNT, u32::MAX);
        let start = time::tick();
        while time::tick() - start < CALIBRATE_DURATION_US {
            core::hint::spin_loop();
        }
        self.write(REG_LVT_TIMER, 0xFF | LVT_MASKED);
        let stop = time::tick();
        let counted = u32::MAX - self.read(REG_TIMER_CURCNT);

        // APIC ticks per microsecond, scaled by 2^32 for fixed-point
        // error math.
        let elapsed = (stop - start).max(1);
        let rate_fp = ((u64::from(counted)) << 32) / elapsed;

        let mut best = TimerCalibration {
            initial_count: (rate_fp >> 32) as u32,
            period_us: 1,
        };
        let mut best_error = u64::MAX;
        for period in PERIOD_SEARCH_US.0..=PERIOD_SEARCH_US.1 {
            let total_fp = rate_fp * u64::from(period);
            let frac = total_fp & 0xFFFF_FFFF;
            // Distance to the nearest integer count.
            let error = frac.min((1u64 << 32) - frac);
            if error < best_error {
                best_error = error;
                best = TimerCalibration {
                    initial_count: ((total_fp + (1 << 31)) >> 32) as u32,
                    period_us: period,
                };
            }
        }

        self.write(REG_LVT_TIMER, lvt_orig);
        best
    }

    /// Starts the timer in periodic mode on `vector` with a previously
    /// computed calibration.
    pub fn enable_timer(&self, vector: u8, calibration: TimerCalibration) {
        self.write(REG_TIMER_DIV, TIMER_DIV_16);
        self.write(REG_LVT_TIMER, u32::from(vector) | LVT_TIMER_PERIODIC);
        self.write(REG_TIMER_INITCNT, calibration.initial_count);
    }

    /// Stops the timer.
    pub fn disable_timer(&self) {
        self.write(REG_LVT_TIMER, LVT_MASKED);
        self.write(REG_TIMER_INITCNT, 0);
    }

    #[inline]
    fn read(&self, reg: u32) -> u32 {
        // SAFETY: `base` maps the LAPIC window per the constructor
        // contract.
        unsafe { mmio::read32(self.base + reg) }
    }

    #[inline]
    fn write(&self, reg: u32, value: u32) {
        // SAFETY: Same as `read`.
        unsafe { mmio::write32(self.base + reg, value) }
    }
}
