use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::InstanceSnapshot;
use crate::SessionState;

pub const CODE_OK: u16 = 200;
pub const CODE_BAD_REQUEST: u16 = 400;
pub const CODE_NOT_FOUND: u16 = 404;
pub const CODE_INTERNAL: u16 = 500;

/// A request addressed to the instance registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HerdRequest {
    Create {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        #[serde(default)]
        agent_label: String,
        /// Worker configuration, forwarded to the worker as environment.
        #[serde(default)]
        config: Map<String, Value>,
    },
    Get {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        id: i32,
    },
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
    },
    Delete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        id: i32,
    },
    Update {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        id: i32,
        session_state: SessionState,
    },
}

impl HerdRequest {
    pub fn request_id(&self) -> Option<&Value> {
        match self {
            HerdRequest::Create { request_id, .. }
            | HerdRequest::Get { request_id, .. }
            | HerdRequest::List { request_id }
            | HerdRequest::Delete { request_id, .. }
            | HerdRequest::Update { request_id, .. } => request_id.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    Instance(Box<InstanceSnapshot>),
    Instances(Vec<InstanceSnapshot>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HerdResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
    pub code: u16,
    pub msg: String,
    pub data: Option<ResponseData>,
}

impl HerdResponse {
    pub fn ok(data: Option<ResponseData>) -> Self {
        Self {
            request_id: None,
            code: CODE_OK,
            msg: "success".to_string(),
            data,
        }
    }

    pub fn error(code: u16, msg: impl Into<String>) -> Self {
        Self {
            request_id: None,
            code,
            msg: msg.into(),
            data: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<Value>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_OK
    }
}
