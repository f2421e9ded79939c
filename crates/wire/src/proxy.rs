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

//! Frames multiplexed on the SSH proxy stream.
//!
//! Frames for distinct connection IDs interleave freely; frames for one
//! connection ID are ordered. `connected` always precedes the first `data`
//! of a session, and `closed` or `error` is the last frame of a session.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyFrame {
    /// Client side asks for a new tunnel to `target:port`. Port 0 means 22.
    Connect {
        #[serde(rename = "connectionID")]
        connection_id: String,
        target: String,
        #[serde(default)]
        port: u16,
    },
    /// Payload bytes, in either direction.
    Data {
        #[serde(rename = "connectionID")]
        connection_id: String,
        #[serde(with = "crate::base64_bytes")]
        data: Vec<u8>,
    },
    /// Client side tears the tunnel down.
    Close {
        #[serde(rename = "connectionID")]
        connection_id: String,
    },
    /// The dial to the target succeeded.
    Connected {
        #[serde(rename = "connectionID")]
        connection_id: String,
    },
    /// Dial or mid-stream failure.
    Error {
        #[serde(rename = "connectionID")]
        connection_id: String,
        error: String,
    },
    /// Clean termination.
    Closed {
        #[serde(rename = "connectionID")]
        connection_id: String,
    },
}

impl ProxyFrame {
    pub fn connection_id(&self) -> &str {
        match self {
            ProxyFrame::Connect { connection_id, .. }
            | ProxyFrame::Data { connection_id, .. }
            | ProxyFrame::Close { connection_id }
            | ProxyFrame::Connected { connection_id }
            | ProxyFrame::Error { connection_id, .. }
            | ProxyFrame::Closed { connection_id } => connection_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_defaults_port() {
        let frame: ProxyFrame =
            serde_json::from_str(r#"{"type":"connect","connectionID":"c1","target":"10.0.0.10"}"#)
                .unwrap();
        assert_eq!(
            frame,
            ProxyFrame::Connect {
                connection_id: "c1".to_string(),
                target: "10.0.0.10".to_string(),
                port: 0,
            }
        );
    }

    #[test]
    fn test_data_payload_is_base64() {
        let frame = ProxyFrame::Data {
            connection_id: "c1".to_string(),
            data: b"SSH-2.0-mock".to_vec(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "data");
        assert_eq!(json["data"], "U1NILTIuMC1tb2Nr");

        let back: ProxyFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = ProxyFrame::Error {
            connection_id: "c9".to_string(),
            error: "dial failed".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["connectionID"], "c9");
        assert_eq!(json["error"], "dial failed");
    }
}
