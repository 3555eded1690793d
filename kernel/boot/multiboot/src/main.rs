//! Multiboot2 boot stub for the muon kernel.
//!
//! Declares the multiboot2 header, builds the bootstrap page directory
//! (16 MiB of PSE pages both identity-mapped and at the higher-half
//! base, plus the recursive slot), enables paging, moves to the higher
//! half, drops the identity window, and calls
//! [`kernel_init`](muon_kernel::kernel_init).

#![no_std]
#![no_main]

use muon_kernel::kernel_init;

core::arch::global_asm!(
    r#"
// ── Multiboot2 header ───────────────────────────────────────────────
.section .multiboot2, "a"
.align 8
mb2_header_start:
.long 0xE85250D6                 // magic
.long 0                          // architecture: i386 protected mode
.long mb2_header_end - mb2_header_start
.long -(0xE85250D6 + 0 + (mb2_header_end - mb2_header_start))
// end tag
.word 0
.word 0
.long 8
mb2_header_end:

// ── Bootstrap storage ───────────────────────────────────────────────
.section .bss
.align 4096
boot_page_directory:
.skip 4096
.global __boot_stack_bottom
__boot_stack_bottom:
.skip 16384
.global __boot_stack_top
__boot_stack_top:

// ── Entry (runs at the physical load address, paging off) ──────────
.section .boot, "ax"
.global _start
.type _start, @function
_start:
    cli
    mov esi, ebx                 // multiboot2 info pointer

    // 16 MiB of 4 MiB PSE pages: identity and at the kernel base.
    lea edi, [boot_page_directory - 0xC0000000]
    mov eax, 0x00000083          // present | writable | PSE, frame 0
    xor ecx, ecx
1:
    mov [edi + ecx*4], eax
    mov [edi + 768*4 + ecx*4], eax
    add eax, 0x400000
    inc ecx
    cmp ecx, 4
    jne 1b

    // Recursive slot: the directory maps itself at the top 4 MiB.
    lea eax, [boot_page_directory - 0xC0000000]
    or eax, 0x3                  // present | writable
    mov [edi + 1023*4], eax

    // PSE + PGE on, directory loaded, paging + write protect on.
    mov eax, cr4
    or eax, 0x90
    mov cr4, eax
    lea eax, [boot_page_directory - 0xC0000000]
    mov cr3, eax
    mov eax, cr0
    or eax, 0x80010000
    mov cr0, eax

    lea eax, [2f]
    jmp eax

.section .text
2:
    // Higher half: drop the identity window and its TLB entries.
    mov dword ptr [boot_page_directory + 0*4], 0
    mov dword ptr [boot_page_directory + 1*4], 0
    mov dword ptr [boot_page_directory + 2*4], 0
    mov dword ptr [boot_page_directory + 3*4], 0
    mov eax, cr3
    mov cr3, eax

    lea esp, [__boot_stack_top]
    add esi, 0xC0000000          // the info now lives behind the kernel base
    push esi
    call boot_main
3:
    hlt
    jmp 3b
.size _start, . - _start
"#
);

/// Rust-side landing point for the boot assembly.
///
/// # Safety
///
/// Called exactly once by `_start` with paging and the boot stack live.
#[unsafe(no_mangle)]
unsafe extern "C" fn boot_main(mb_ptr: usize) -> ! {
    // SAFETY: The stub established the mappings `kernel_init` expects.
    unsafe { kernel_init(mb_ptr) }
}
