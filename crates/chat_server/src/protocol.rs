/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The JSON frames exchanged over `/ws`, tagged on `"type"`.

use serde::{Deserialize, Serialize};

/// A frame sent by the client.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Welcome,
    Input {
        #[serde(deserialize_with = "non_empty_string")]
        content: String,
    },
    Abort,
    Bye,
}

fn non_empty_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        return Err(serde::de::Error::custom("content: must not be empty"));
    }
    Ok(s)
}

/// A frame sent by the server.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: i64,
    },
    StreamStart,
    StreamTextDelta {
        delta: String,
    },
    StreamDone {
        #[serde(rename = "sessionId")]
        session_id: i64,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // `ServerMessage` only holds types that always serialize; a failure here would be
        // a bug in this enum, not a runtime condition callers need to handle.
        serde_json::to_string(self).expect("ServerMessage always serializes")
    }
}

/// Close codes used when the socket must be torn down from the server side.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const POLICY_VIOLATION: u16 = 1008;
}

/// Parses one inbound text frame, producing the `"<path>: <message>"`-joined message
/// format the protocol uses for validation errors.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, String> {
    serde_json::from_str(raw).map_err(|e| {
        if e.is_syntax() {
            "invalid JSON".to_string()
        } else {
            format!("body: {e}")
        }
    })
}
