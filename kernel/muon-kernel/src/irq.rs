//! Interrupt routing data structures.
//!
//! The pure half of the interrupt routing core: growable handler tables
//! with tombstone reuse, the legacy-IRQ to GSI mapping, and the spurious
//! interrupt decision. The hardware half (PIC, LAPIC, I/O APIC, vector
//! stubs) lives in [`interrupts`](crate::interrupts) and `arch`.

use alloc::vec::Vec;

/// Saved register state handed to interrupt handlers.
///
/// Mirrors the stub push order (segment, general registers, vector and
/// error code, then the CPU-pushed frame).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct IrqContext {
    /// Data segment selector active when the interrupt fired.
    pub ds: u32,
    /// General registers in `pushad` order.
    pub edi: u32,
    /// `esi`.
    pub esi: u32,
    /// `ebp`.
    pub ebp: u32,
    /// `esp` at the time of `pushad` (ignored by `popad`).
    pub esp: u32,
    /// `ebx`.
    pub ebx: u32,
    /// `edx`.
    pub edx: u32,
    /// `ecx`.
    pub ecx: u32,
    /// `eax`.
    pub eax: u32,
    /// Vector number pushed by the stub.
    pub vector: u32,
    /// Error code (zero for vectors without one).
    pub error_code: u32,
    /// Faulting instruction pointer.
    pub eip: u32,
    /// Code segment selector.
    pub cs: u32,
    /// Saved flags.
    pub eflags: u32,
    /// User stack pointer (only valid on a privilege change).
    pub user_esp: u32,
    /// User stack segment (only valid on a privilege change).
    pub user_ss: u32,
}

/// An interrupt handler callback; receives the IRQ (or GSI) number and
/// the interrupted context.
pub type IrqHandler = fn(u8, &mut IrqContext);

/// Opaque id returned by [`HandlerTable::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(usize);

/// A growable `(irq, callback)` table with tombstone reuse.
///
/// Several callbacks may be registered for the same line; dispatch calls
/// them in registration order.
#[derive(Default)]
pub struct HandlerTable {
    slots: Vec<Option<(u8, IrqHandler)>>,
}

impl HandlerTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Registers `handler` for `irq`, reusing a tombstoned slot if one
    /// exists.
    pub fn handle(&mut self, irq: u8, handler: IrqHandler) -> HandlerId {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some((irq, handler));
                return HandlerId(i);
            }
        }
        self.slots.push(Some((irq, handler)));
        HandlerId(self.slots.len() - 1)
    }

    /// Unregisters a previously registered handler.
    pub fn unhandle(&mut self, id: HandlerId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Whether any handler is registered for `irq`.
    pub fn is_handled(&self, irq: u8) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|(line, _)| *line == irq)
    }

    /// Calls every handler registered for `irq` in registration order.
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, irq: u8, ctx: &mut IrqContext) -> usize {
        let mut invoked = 0;
        for (line, handler) in self.slots.iter().flatten() {
            if *line == irq {
                handler(irq, ctx);
                invoked += 1;
            }
        }
        invoked
    }

    /// Visits the handlers registered for `irq` in registration order
    /// without invoking them. Lets the dispatcher copy callbacks out
    /// before releasing its lock.
    pub fn for_each(&self, irq: u8, mut f: impl FnMut(IrqHandler)) {
        for (line, handler) in self.slots.iter().flatten() {
            if *line == irq {
                f(*handler);
            }
        }
    }

    /// IRQ lines with at least one registered handler (deduplicated).
    pub fn handled_lines(&self) -> Vec<u8> {
        let mut lines: Vec<u8> = Vec::new();
        for (line, _) in self.slots.iter().flatten() {
            if !lines.contains(line) {
                lines.push(*line);
            }
        }
        lines
    }
}

/// Legacy IRQ line to Global System Interrupt mapping.
///
/// Identity by default; rewritten from firmware source-override entries.
#[derive(Debug, Clone, Copy)]
pub struct GsiMap {
    map: [u32; 16],
}

impl GsiMap {
    /// Creates the identity mapping.
    pub const fn identity() -> Self {
        let mut map = [0u32; 16];
        let mut i = 0;
        while i < 16 {
            map[i] = i as u32;
            i += 1;
        }
        Self { map }
    }

    /// Applies a source override.
    pub fn set_override(&mut self, irq: u8, gsi: u32) {
        if (irq as usize) < self.map.len() {
            self.map[irq as usize] = gsi;
        }
    }

    /// GSI raised by a legacy IRQ line.
    pub fn gsi(&self, irq: u8) -> u32 {
        self.map[irq as usize & 0xF]
    }

    /// Reverse lookup: the legacy IRQ routed to `gsi`, if any.
    pub fn irq_for(&self, gsi: u32) -> Option<u8> {
        self.map.iter().position(|g| *g == gsi).map(|i| i as u8)
    }
}

impl Default for GsiMap {
    fn default() -> Self {
        Self::identity()
    }
}

/// Outcome of the spurious filter for a PIC interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicDelivery {
    /// A genuine interrupt: dispatch handlers, then EOI normally.
    Genuine,
    /// Spurious IRQ 7: drop silently, no EOI at all.
    DropSilent,
    /// Spurious IRQ 15: drop, but the cascade line on the primary PIC
    /// still needs an EOI.
    DropWithCascadeEoi,
}

/// Classifies a PIC interrupt against the in-service register.
///
/// IRQ 7 and 15 are the lowest-priority lines of their controllers; if an
/// interrupt arrives on one of them without the matching ISR bit, the
/// controller glitched and no handler may run.
pub fn classify_pic_irq(irq: u8, isr: u16) -> PicDelivery {
    match irq {
        7 | 15 if isr & (1 << irq) == 0 => {
            if irq == 15 {
                PicDelivery::DropWithCascadeEoi
            } else {
                PicDelivery::DropSilent
            }
        }
        _ => PicDelivery::Genuine,
    }
}
