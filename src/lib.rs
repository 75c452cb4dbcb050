// SPDX-License-Identifier: MIT
//! SSSonector: a point-to-point, mutually-authenticated TLS tunnel
//! bridging two TUN interfaces.

pub mod cert;
pub mod config;
pub mod error;
pub mod ipc;
pub mod limiter;
pub mod logging;
pub mod monitor;
pub mod resilience;
pub mod session;
pub mod supervisor;
pub mod tun;
