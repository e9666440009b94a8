#![cfg_attr(not(test), no_std)]

//! CockpitVM, an embedded hypervisor for microcontroller-class targets.
//!
//! A host firmware image accepts compiled guest bytecode over a serial
//! link, stages it into a reserved flash page, verifies it, and executes
//! it under a sandboxed stack virtual machine with a restricted hardware
//! API (GPIO, timing, serial, analog).
//!
//! The crate is split along the natural seams of the system:
//!
//! - [`frame`]: length-prefixed, CRC-protected, byte-stuffed serial framing
//! - [`queue`]: the single ISR/foreground shared structure, a lock-free
//!   SPSC byte queue
//! - [`flash`]: doubleword staging, read-back verification, dual-bank
//!   fallback
//! - [`bootloader`]: the framed request/response protocol driving
//!   handshake, prepare, data, program and verify
//! - [`vm`]: the bytecode interpreter, its memory model and host-call
//!   surface
//! - [`sim`]: in-memory platform implementations for host-side tests and
//!   development
//!
//! Hardware access goes through the [`time::Clock`], [`platform::HostIo`]
//! and [`flash::FlashControl`] traits; a board support crate provides the
//! real implementations.

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod time;

pub mod frame;
pub mod gpio;
pub mod queue;

pub mod flash;
pub mod platform;
pub mod sim;

pub mod bootloader;
pub mod vm;

pub use bootloader::Bootloader;
pub use vm::Vm;
