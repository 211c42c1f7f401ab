// SPDX-License-Identifier: Apache-2.0

//! Bundled MMIO devices. The CLINT is part of the core contract; anything
//! richer (UART, block storage) lives with the embedder.

pub mod clint;

pub use clint::Clint;
