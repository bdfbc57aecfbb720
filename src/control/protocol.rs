//! Wire types for the Control Surface: a JSON object per line, one
//! request or response per line, over a persistent TCP connection.

use serde::{Deserialize, Serialize};

/// One control-surface request. Tagged on `op` so a bare JSON object on the
/// wire (`{"op": "PING"}`) deserializes directly into the right variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op")]
pub enum Request {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "RUN")]
    Run { pipeline: String },
    #[serde(rename = "STATUS")]
    Status { label: String },
    #[serde(rename = "DATA")]
    Data { label: String },
    #[serde(rename = "LOGS")]
    Logs { task_label: String },
    #[serde(rename = "EVENTS")]
    Events { task_label: String },
    #[serde(rename = "CLEANUP")]
    Cleanup {
        label: String,
        #[serde(default)]
        db: bool,
        #[serde(default)]
        fs: bool,
    },
    #[serde(rename = "SHOW")]
    Show { query: String },
}

/// A response line. `Ok` carries whatever payload the operation produces;
/// `Err` is the uniform error shape every operation reports on failure.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ok {
        success: bool,
        #[serde(flatten)]
        body: serde_json::Value,
    },
    Err {
        status: &'static str,
        response: String,
    },
}

impl Response {
    pub fn ok(body: serde_json::Value) -> Self {
        Response::Ok {
            success: true,
            body,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Err {
            status: "ERROR",
            response: message.into(),
        }
    }
}
