//! Status codes shared by every component of the bus
//!
//! Codes are partitioned by class: 100-199 are success or informational,
//! 200 and above are failures. Every fallible operation can be reduced to one
//! of these codes, and the codes travel on the wire inside result envelopes.

use core::fmt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::value::Value;

// ----------------------------------------------------------------------------
// Status Code
// ----------------------------------------------------------------------------

/// Numeric status code carried by ticks, replies and result envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const SUCCESS: StatusCode = StatusCode(100);
    pub const SYSTEM_RUNNING: StatusCode = StatusCode(101);
    pub const SYSTEM_SHUTDOWN: StatusCode = StatusCode(102);
    pub const PROCESS_SHUTDOWN: StatusCode = StatusCode(103);
    pub const PROCESS_TIMEOUT: StatusCode = StatusCode(104);
    pub const RETURN_STACK: StatusCode = StatusCode(105);

    pub const FAILED: StatusCode = StatusCode(200);
    pub const INTERFACE_BANNED: StatusCode = StatusCode(201);
    pub const JSON_ERROR: StatusCode = StatusCode(202);
    pub const COMMAND_ERROR: StatusCode = StatusCode(203);
    pub const SYSTEM_ERROR: StatusCode = StatusCode(204);
    pub const FILE_ERROR: StatusCode = StatusCode(205);
    pub const BUFFER_ERROR: StatusCode = StatusCode(206);
    pub const REQUEST_ERROR: StatusCode = StatusCode(207);
    pub const AUTH_ERROR: StatusCode = StatusCode(208);
    pub const CODEC_ERROR: StatusCode = StatusCode(209);
    pub const TCP_CONN_ERROR: StatusCode = StatusCode(210);
    pub const UDP_CONN_ERROR: StatusCode = StatusCode(211);
    pub const URL_ERROR: StatusCode = StatusCode(212);
    pub const PATH_ERROR: StatusCode = StatusCode(213);
    pub const WEBSOCKET_ERROR: StatusCode = StatusCode(214);
    pub const TRANSFORM_ERROR: StatusCode = StatusCode(215);
    pub const IO_READER_ERROR: StatusCode = StatusCode(216);
    pub const PLATFORM_ERROR: StatusCode = StatusCode(217);
    pub const EXEC_ERROR: StatusCode = StatusCode(218);
    pub const CONVERT_ERROR: StatusCode = StatusCode(219);
    pub const NULL_ERROR: StatusCode = StatusCode(220);
    pub const DATA_TYPE_ERROR: StatusCode = StatusCode(221);
    pub const UART_ERROR: StatusCode = StatusCode(222);

    pub const DATABASE_DISCONNECTED: StatusCode = StatusCode(300);
    pub const QUERY_ERROR: StatusCode = StatusCode(301);
    pub const TRANSACTION_ERROR: StatusCode = StatusCode(302);
    pub const ROLLBACK_ERROR: StatusCode = StatusCode(303);
    pub const COMMIT_ERROR: StatusCode = StatusCode(304);
    pub const DATA_ANALYZE_ERROR: StatusCode = StatusCode(305);

    pub const REDIS_DISCONNECTED: StatusCode = StatusCode(400);
    pub const REDIS_ERROR: StatusCode = StatusCode(401);

    /// Codes in [100, 200) keep a loop running
    pub fn is_success(self) -> bool {
        (100..200).contains(&self.0)
    }

    /// Codes at or above 200 terminate a loop
    pub fn is_failure(self) -> bool {
        self.0 >= 200
    }

    /// Canonical text for the code, "Failed" for unknown codes
    pub fn message(self) -> &'static str {
        match self.0 {
            100 => "Success",
            101 => "System Running",
            102 => "System ShutDown",
            103 => "Process ShutDown",
            104 => "Process Timeout",
            105 => "Return Stack",
            201 => "Interface Banned",
            202 => "JSON Error",
            203 => "Command Error",
            204 => "System Error",
            205 => "File Error",
            206 => "Buffer Error",
            207 => "Request Error",
            208 => "Auth Error",
            209 => "Encode/Decode Error",
            210 => "TCP Conn Error",
            211 => "UDP Conn Error",
            212 => "Url Error",
            213 => "Path Error",
            214 => "Websocket Error",
            215 => "Transform Error",
            216 => "IOReader Error",
            217 => "Platform Error",
            218 => "Exec Error",
            219 => "Convert Error",
            220 => "Null Error",
            221 => "DataType Error",
            222 => "UART Error",
            300 => "Database Disconnected",
            301 => "Query Error",
            302 => "TransAction Error",
            303 => "RollBack Error",
            304 => "Commit Error",
            305 => "Data Analyze Error",
            400 => "Redis Disconnected",
            401 => "Redis Error",
            _ => "Failed",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.message())
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        StatusCode(code)
    }
}

// ----------------------------------------------------------------------------
// Result Envelope
// ----------------------------------------------------------------------------

/// Structured result written into action callbacks and reply payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Code")]
    pub code: StatusCode,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Data", default)]
    pub data: Value,
}

impl Message {
    /// Build a message whose text is the code's canonical text
    pub fn new(code: StatusCode, data: impl Into<Value>) -> Self {
        Self {
            code,
            message: code.message().to_string(),
            data: data.into(),
        }
    }

    pub fn success(data: impl Into<Value>) -> Self {
        Self::new(StatusCode::SUCCESS, data)
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Log a status report at a level chosen by the code class
///
/// 100 is logged at info, other success codes at warn, failures at error.
pub fn report(component: &str, function: &str, code: StatusCode, detail: impl fmt::Debug) {
    if code == StatusCode::SUCCESS {
        info!(component, function, code = code.0, "{}: {:?}", code.message(), detail);
    } else if code.is_success() {
        warn!(component, function, code = code.0, "{}: {:?}", code.message(), detail);
    } else {
        error!(component, function, code = code.0, "{}: {:?}", code.message(), detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(StatusCode::SUCCESS.is_success());
        assert!(StatusCode::PROCESS_TIMEOUT.is_success());
        assert!(!StatusCode::FAILED.is_success());
        assert!(StatusCode::WEBSOCKET_ERROR.is_failure());
    }

    #[test]
    fn test_unknown_code_message() {
        assert_eq!(StatusCode(299).message(), "Failed");
        assert_eq!(StatusCode::CODEC_ERROR.message(), "Encode/Decode Error");
    }

    #[test]
    fn test_message_json_shape() {
        let msg = Message::success("Pong");
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"Code":100,"Message":"Success","Data":"Pong"}"#);
        assert_eq!(Message::from_json(&json).unwrap(), msg);
    }
}
