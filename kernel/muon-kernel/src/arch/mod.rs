//! Architecture support.
//!
//! Only the x86 (32-bit protected mode) port exists today.

pub mod x86;

pub use x86::cpu_init;
