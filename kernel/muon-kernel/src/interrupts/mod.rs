//! Interrupt routing core.
//!
//! Presents a single abstraction over the legacy 8259 pair and the
//! APIC complex so drivers deal only in IRQ numbers. Internally
//! everything funnels through a linear GSI space: with the APIC active,
//! legacy registrations are reached through an adapter installed at
//! their GSI; without it, GSI-level operations lower to the PIC.
//!
//! Vector layout: CPU exceptions in `[0, 0x20)`, the PIC window at
//! `[VECT_BASE, VECT_BASE + 16)`, software interrupts (syscall, yield)
//! after it, the GSI window from `VECT_BASE + GSI_VECT_OFFSET`, the
//! LAPIC timer at [`LAPIC_TIMER_VECTOR`], and the fixed spurious vector
//! at 0xFF.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use muon_acpi::topology::InterruptTopology;
use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::sync::{InitOnce, SpinLock};
use muon_mm::mapper::PageFlags;

use crate::arch::x86::apic::io::{DeliveryMode, IoApic, Polarity, RedirectionEntry, TriggerMode};
use crate::arch::x86::apic::local::LocalApic;
use crate::arch::x86::pic;
use crate::config::{
    GSI_VECT_OFFSET, MMIO_BASE, MMIO_END, SPURIOUS_VECTOR, SYSCALL_VECTOR, VECT_BASE, YIELD_VECTOR,
};
use crate::irq::{
    GsiMap, HandlerId, HandlerTable, IrqContext, PicDelivery, classify_pic_irq,
};
use crate::mm::vmm;
use crate::{kdebug, kerror, kinfo, kwarn};

/// Vector driving the LAPIC timer.
pub const LAPIC_TIMER_VECTOR: u8 = 0xF0;

/// Vector NMI sources are wired to.
const NMI_VECTOR: u8 = 2;

/// At most this many callbacks fire per line and delivery.
const MAX_CALLBACKS_PER_LINE: usize = 8;

static PIC_TABLE: SpinLock<HandlerTable> = SpinLock::new(HandlerTable::new());
static GSI_TABLE: SpinLock<HandlerTable> = SpinLock::new(HandlerTable::new());
static IRQ_GSI: SpinLock<GsiMap> = SpinLock::new(GsiMap::identity());
static APIC_ACTIVE: AtomicBool = AtomicBool::new(false);

/// The BSP's local APIC; written once during `apic_init`, then read
/// lock-free (the EOI path runs inside every interrupt).
static LAPIC: InitOnce<LocalApic> = InitOnce::new();
static IO_APICS: SpinLock<Vec<IoApic>> = SpinLock::new(Vec::new());

/// Brings up the legacy PIC: vectors remapped onto [`VECT_BASE`], all
/// lines masked except the cascade.
///
/// # Safety
///
/// Must run once during boot with interrupts disabled.
pub unsafe fn init() {
    // SAFETY: Boot-time, interrupts disabled.
    unsafe { pic::init() };
    kdebug!("intr: PIC remapped to {:#04x}", VECT_BASE);
}

/// Whether the APIC has taken over interrupt delivery.
pub fn apic_active() -> bool {
    APIC_ACTIVE.load(Ordering::Acquire)
}

/// Registers `handler` for a legacy IRQ line. With the APIC active, a
/// legacy adapter at the corresponding GSI carries the dispatch and the
/// line's mask state is preserved.
pub fn handle(irq: u8, handler: crate::irq::IrqHandler) -> HandlerId {
    let id = PIC_TABLE.lock().handle(irq, handler);
    if apic_active() {
        let gsi = IRQ_GSI.lock().gsi(irq);
        if !GSI_TABLE.lock().is_handled(gsi as u8) {
            GSI_TABLE.lock().handle(gsi as u8, legacy_adapter);
        }
    }
    id
}

/// Unregisters a legacy handler.
pub fn unhandle(id: HandlerId) {
    PIC_TABLE.lock().unhandle(id);
}

/// Registers `handler` directly at GSI level.
pub fn gsi_handle(gsi: u32, handler: crate::irq::IrqHandler) -> HandlerId {
    GSI_TABLE.lock().handle(gsi as u8, handler)
}

/// Unregisters a GSI handler.
pub fn gsi_unhandle(id: HandlerId) {
    GSI_TABLE.lock().unhandle(id);
}

/// Masks an IRQ line, at GSI level when the APIC is active.
pub fn mask(irq: u8) {
    if apic_active() {
        gsi_mask(IRQ_GSI.lock().gsi(irq));
    } else {
        pic::mask(irq);
    }
}

/// Unmasks an IRQ line, at GSI level when the APIC is active.
pub fn unmask(irq: u8) {
    if apic_active() {
        gsi_unmask(IRQ_GSI.lock().gsi(irq));
    } else {
        pic::unmask(irq);
    }
}

/// Masks a GSI. Without the APIC, lowers to the PIC line mapped to it.
pub fn gsi_mask(gsi: u32) {
    if apic_active() {
        for ioapic in IO_APICS.lock().iter() {
            if ioapic.serves(gsi) {
                ioapic.mask(gsi);
                return;
            }
        }
    } else if let Some(irq) = IRQ_GSI.lock().irq_for(gsi) {
        pic::mask(irq);
    }
}

/// Unmasks a GSI. Without the APIC, lowers to the PIC line mapped to it.
pub fn gsi_unmask(gsi: u32) {
    if apic_active() {
        for ioapic in IO_APICS.lock().iter() {
            if ioapic.serves(gsi) {
                ioapic.unmask(gsi);
                return;
            }
        }
    } else if let Some(irq) = IRQ_GSI.lock().irq_for(gsi) {
        pic::unmask(irq);
    }
}

/// The legacy adapter installed at a GSI whose line has PIC-level
/// registrations: dispatches the PIC handler table.
fn legacy_adapter(gsi: u8, ctx: &mut IrqContext) {
    let irq = IRQ_GSI.lock().irq_for(u32::from(gsi));
    if let Some(irq) = irq {
        dispatch_table(&PIC_TABLE, irq, ctx);
    }
}

/// Copies the matching callbacks out under the lock, then invokes them
/// unlocked so handlers may touch the registration API.
fn dispatch_table(table: &SpinLock<HandlerTable>, line: u8, ctx: &mut IrqContext) -> usize {
    let mut callbacks: [Option<crate::irq::IrqHandler>; MAX_CALLBACKS_PER_LINE] =
        [None; MAX_CALLBACKS_PER_LINE];
    let mut count = 0;
    {
        let table = table.lock();
        table.for_each(line, |handler| {
            if count < MAX_CALLBACKS_PER_LINE {
                callbacks[count] = Some(handler);
                count += 1;
            }
        });
    }
    for cb in callbacks.iter().flatten() {
        cb(line, ctx);
    }
    count
}

/// Generic dispatcher: called by every vector trampoline with the saved
/// context. Acknowledges the interrupt after the handlers return.
pub(crate) extern "C" fn dispatch_raw(ctx: *mut IrqContext) {
    // SAFETY: The trampoline passes a pointer to the context it pushed.
    let ctx = unsafe { &mut *ctx };
    dispatch(ctx);
}

fn dispatch(ctx: &mut IrqContext) {
    let vector = ctx.vector as u8;
    match vector {
        0..=0x1F => crate::arch::x86::exceptions::handle(ctx),
        SYSCALL_VECTOR => crate::syscall::dispatch(ctx),
        YIELD_VECTOR => crate::sched::yield_now(),
        SPURIOUS_VECTOR => {
            // LAPIC spurious: silently dropped, no EOI.
        }
        LAPIC_TIMER_VECTOR => {
            crate::time::lapic_tick(ctx);
            lapic_eoi();
        }
        v if v >= VECT_BASE + GSI_VECT_OFFSET => {
            let gsi = v - VECT_BASE - GSI_VECT_OFFSET;
            let n = dispatch_table(&GSI_TABLE, gsi, ctx);
            if n == 0 {
                kdebug!("intr: unhandled GSI {}", gsi);
            }
            lapic_eoi();
        }
        v if (VECT_BASE..VECT_BASE + 16).contains(&v) => {
            let irq = v - VECT_BASE;
            match classify_pic_irq(irq, pic::read_isr()) {
                PicDelivery::Genuine => {
                    let n = dispatch_table(&PIC_TABLE, irq, ctx);
                    if n == 0 {
                        kdebug!("intr: unhandled IRQ {}", irq);
                    }
                    pic::eoi(irq);
                }
                PicDelivery::DropSilent => {
                    kdebug!("intr: spurious IRQ {}", irq);
                }
                PicDelivery::DropWithCascadeEoi => {
                    kdebug!("intr: spurious IRQ {}", irq);
                    pic::eoi_cascade_only();
                }
            }
        }
        v => kwarn!("intr: stray vector {:#04x}", v),
    }
}

fn lapic_eoi() {
    if let Some(lapic) = LAPIC.try_get() {
        lapic.eoi();
    }
}

/// End-of-interrupt for handler-driven paths: LAPIC when active, PIC
/// otherwise.
pub fn eoi(irq: u8) {
    if apic_active() {
        lapic_eoi();
    } else {
        pic::eoi(irq);
    }
}

/// Switches interrupt delivery to the APIC complex per the firmware
/// topology:
///
/// 1. masks every PIC line,
/// 2. brings up the I/O APICs (with a defaulted single-controller
///    fallback when the list is empty),
/// 3. installs masked per-GSI redirection entries targeting the
///    bootstrap CPU,
/// 4. applies source overrides to `irq_to_gsi` and the entry
///    polarity/trigger bits,
/// 5. wires NMI sources to vector 2,
/// 6. re-homes already-registered PIC handlers behind legacy adapters,
///    preserving their mask state.
///
/// # Safety
///
/// Must run once with interrupts disabled, after the heap is up.
pub unsafe fn apic_init(topology: &InterruptTopology) {
    // 1. The PIC stops delivering.
    let premask: [bool; 16] = core::array::from_fn(|irq| pic::is_masked(irq as u8));
    // SAFETY: All lines masked; APIC delivery replaces them.
    unsafe { pic::mask_all() };

    // Map and enable the local APIC.
    let lapic_virt = map_mmio(PhysAddr::new(topology.lapic_base));
    // SAFETY: The LAPIC window was just mapped cache-disabled.
    let lapic = unsafe { LocalApic::new(lapic_virt) };
    lapic.enable();
    let bsp_id = lapic.id();
    kinfo!(
        "apic: LAPIC at {:#010x}, BSP id {}, {} CPU(s) enumerated",
        topology.lapic_base,
        bsp_id,
        topology.cpus.len()
    );

    // 2. I/O APICs, with the defaulted single-controller fallback when
    // the firmware enumerated none.
    let io_list = if topology.io_apics.is_empty() {
        InterruptTopology::fallback().io_apics
    } else {
        topology.io_apics.clone()
    };
    {
        let mut ioapics = IO_APICS.lock();
        for entry in &io_list {
            let virt = map_mmio(PhysAddr::new(entry.address));
            // SAFETY: Mapped cache-disabled just above.
            let ioapic = unsafe { IoApic::new(virt, entry.gsi_base) };
            kdebug!(
                "apic: I/O APIC id {} at {:#010x}, GSI {}..{}",
                ioapic.id(),
                entry.address,
                entry.gsi_base,
                entry.gsi_base + ioapic.inputs()
            );
            ioapics.push(ioapic);
        }

        // 3. Masked redirection entries pointing at the GSI window.
        for ioapic in ioapics.iter() {
            for input in 0..ioapic.inputs() {
                let gsi = ioapic.gsi_base() + input;
                ioapic.set_entry(
                    gsi,
                    RedirectionEntry {
                        vector: VECT_BASE + GSI_VECT_OFFSET + gsi as u8,
                        delivery_mode: DeliveryMode::Fixed,
                        polarity: Polarity::ActiveHigh,
                        trigger_mode: TriggerMode::Edge,
                        masked: true,
                        destination: bsp_id,
                    },
                );
            }
        }

        // 4. Source overrides.
        for over in &topology.overrides {
            IRQ_GSI.lock().set_override(over.irq, over.gsi);
            for ioapic in ioapics.iter() {
                if ioapic.serves(over.gsi) {
                    ioapic.set_trigger(
                        over.gsi,
                        if over.active_low {
                            Polarity::ActiveLow
                        } else {
                            Polarity::ActiveHigh
                        },
                        if over.level_triggered {
                            TriggerMode::Level
                        } else {
                            TriggerMode::Edge
                        },
                    );
                }
            }
            kdebug!("apic: override IRQ {} -> GSI {}", over.irq, over.gsi);
        }

        // 5. NMI sources.
        for nmi in &topology.nmis {
            for ioapic in ioapics.iter() {
                if ioapic.serves(nmi.gsi) {
                    ioapic.set_entry(
                        nmi.gsi,
                        RedirectionEntry {
                            vector: NMI_VECTOR,
                            delivery_mode: DeliveryMode::Nmi,
                            polarity: if nmi.active_low {
                                Polarity::ActiveLow
                            } else {
                                Polarity::ActiveHigh
                            },
                            trigger_mode: if nmi.level_triggered {
                                TriggerMode::Level
                            } else {
                                TriggerMode::Edge
                            },
                            masked: false,
                            destination: bsp_id,
                        },
                    );
                }
            }
        }
        for lint in &topology.lint_nmis {
            lapic.wire_lint_nmi(lint.lint);
        }
    }

    LAPIC.init(lapic);
    APIC_ACTIVE.store(true, Ordering::Release);

    // 6. Re-home existing PIC registrations behind legacy adapters.
    let lines = PIC_TABLE.lock().handled_lines();
    for irq in lines {
        let gsi = IRQ_GSI.lock().gsi(irq);
        if !GSI_TABLE.lock().is_handled(gsi as u8) {
            GSI_TABLE.lock().handle(gsi as u8, legacy_adapter);
        }
        if !premask[irq as usize] {
            gsi_unmask(gsi);
        }
    }
    kinfo!("apic: routing active");
}

/// The local APIC, if active. Used by the timer glue.
pub fn with_lapic<R>(f: impl FnOnce(&LocalApic) -> R) -> Option<R> {
    LAPIC.try_get().map(f)
}

/// Maps one page of device registers, cache-disabled, into the MMIO
/// window.
fn map_mmio(phys: PhysAddr) -> VirtAddr {
    let vmm = vmm::vmm();
    let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL;
    // SAFETY: Firmware-provided MMIO address, mapped into the dedicated
    // window of the kernel space.
    let mapped = unsafe {
        vmm.alloc_map(
            vmm.kernel_space(),
            phys,
            muon_core::paging::PAGE_SIZE,
            VirtAddr::new(MMIO_BASE),
            VirtAddr::new(MMIO_END),
            0,
            0,
            false,
            flags,
        )
    };
    match mapped {
        Ok(va) => va,
        Err(e) => {
            kerror!("intr: cannot map MMIO at {}: {:?}", phys, e);
            panic!("MMIO mapping failed");
        }
    }
}
