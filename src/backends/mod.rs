// SPDX-License-Identifier: GPL-3.0-only

//! Backend abstraction layer for capture devices
//!
//! # Modules
//!
//! - [`camera`]: Device contract, V4L2 and virtual backends, buffer management

pub mod camera;
