//! Guest Platform Layer
//!
//! The pieces of the guest environment that must exist before any device is
//! probed: a serial console, a `log` backend writing to it, and the guest's
//! memory-access-restriction mode.
//!
//! # Boot Order
//!
//! ```text
//! Guest entry
//!        │
//!        ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  1. logger::init()          (diagnostics observable)         │
//! │  2. memmode::init_detected() (restriction mode fixed)        │
//! │                                                              │
//! │  Result: drivers may probe. The memory-access mode is        │
//! │  immutable from here on; probes only read it.                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Non-responsibilities
//!
//! This crate does NOT:
//! - Classify or probe devices (that's the driver layer)
//! - Allocate DMA memory (that's `dma-pool`)
//! - Know about virtio feature bits (that's the driver layer)

#![no_std]

pub mod logger;
pub mod memmode;
pub mod serial;

pub use memmode::MemoryAccessMode;
