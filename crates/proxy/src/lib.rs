/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

//! The SSH reverse-proxy multiplexer.
//!
//! One long-lived stream carries any number of client SSH sessions, each a
//! plain TCP pipe to a tenant address. The multiplexer here is transport
//! agnostic: it consumes and produces [`wire::proxy::ProxyFrame`]s over
//! channels, and the serving layer bridges those to the actual stream.
//!
//! Guarantees (and what tests pin down): frames of one session stay in
//! order, `connected` precedes the session's first `data`, the final frame
//! of a session is `closed` or `error`, and no task outlives its session.

mod dialer;
mod mux;
mod observer;

pub use dialer::{Dialer, SessionStream, TcpDialer};
pub use mux::run_stream;
pub use observer::{NoopObserver, ProxyObserver};

use std::time::Duration;

/// How long a dial to the tenant address may take.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a write towards the tenant may stall before the session dies.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default SSH port when a connect frame leaves the port at zero.
pub const DEFAULT_TARGET_PORT: u16 = 22;
