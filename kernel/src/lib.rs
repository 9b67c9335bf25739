//! Meridian OS Kernel
//!
//! Core kernel support libraries for Meridian OS.
//!
//! # Architecture Overview
//!
//! The kernel is organized into NT-style subsystems:
//!
//! - **ke** - Kernel Executive: spinlocks, queued locks, shared-exclusive locks
//! - **ob** - Object Manager: wait queues, handle tables
//! - **mm** - Memory Manager: memory descriptor lists
//! - **rtl** - Runtime Library: arena-backed red-black trees
//! - **hal** - Hardware Abstraction Layer: time and thread identity hooks
//!
//! Everything here builds on `core` and `alloc` alone. The few
//! hardware services the primitives need, a millisecond counter and a
//! current-thread identifier, are function pointers registered through
//! [`hal`] during early boot, which also lets host-side tests supply
//! their own.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod hal;
pub mod ke;
pub mod mm;
pub mod ob;
pub mod rtl;
pub mod status;
