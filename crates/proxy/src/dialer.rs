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
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Anything the proxy can pipe bytes through. Tests use
/// `tokio::io::duplex` pairs instead of sockets.
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionStream for T {}

#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, target: &str, port: u16) -> std::io::Result<Box<dyn SessionStream>>;
}

/// Production dialer: a direct TCP connection to the tenant address.
#[derive(Debug, Default)]
pub struct TcpDialer;

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &str, port: u16) -> std::io::Result<Box<dyn SessionStream>> {
        let stream = TcpStream::connect((target, port)).await?;
        // Interactive SSH traffic; don't batch keystrokes.
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}
