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
use std::time::Duration;

/// Session lifecycle hooks. The daemon hangs its metrics off these; the
/// multiplexer itself stays metrics-free.
pub trait ProxyObserver: Send + Sync + 'static {
    fn session_opened(&self, target: &str);
    fn session_closed(&self, target: &str, duration: Duration, bytes_up: u64, bytes_down: u64);
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl ProxyObserver for NoopObserver {
    fn session_opened(&self, _target: &str) {}
    fn session_closed(&self, _target: &str, _duration: Duration, _bytes_up: u64, _bytes_down: u64) {
    }
}
