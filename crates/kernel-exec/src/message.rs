//! Kernel output messages, reduced to what script execution consumes.

use serde::{Deserialize, Serialize};

/// MIME type to payload, as published in `execute_result` and `display_data`.
pub type MimeBundle = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelActivity {
    Busy,
    Idle,
}

/// An iopub message belonging to the execute request currently in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum KernelMessage {
    Stream {
        name: String,
        text: String,
    },
    Result {
        data: MimeBundle,
        #[serde(default)]
        metadata: MimeBundle,
    },
    Display {
        data: MimeBundle,
        #[serde(default)]
        metadata: MimeBundle,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    Status {
        state: KernelActivity,
    },
}

impl KernelMessage {
    pub fn stdout(text: impl Into<String>) -> Self {
        KernelMessage::Stream {
            name: "stdout".to_string(),
            text: text.into(),
        }
    }

    pub fn idle() -> Self {
        KernelMessage::Status {
            state: KernelActivity::Idle,
        }
    }

    pub fn busy() -> Self {
        KernelMessage::Status {
            state: KernelActivity::Busy,
        }
    }

    /// A `text/plain` execute result.
    pub fn plain_result(text: impl Into<String>) -> Self {
        let mut data = MimeBundle::new();
        data.insert("text/plain".to_string(), text.into().into());
        KernelMessage::Result {
            data,
            metadata: MimeBundle::new(),
        }
    }

    /// The idle status that ends every execute request.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            KernelMessage::Status {
                state: KernelActivity::Idle
            }
        )
    }
}
