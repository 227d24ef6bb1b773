//! Translates wire requests into registry calls and registry results into
//! coded responses.

use herd_protocol::HerdRequest;
use herd_protocol::HerdResponse;
use herd_protocol::ResponseData;
use herd_protocol::request::CODE_BAD_REQUEST;
use herd_protocol::request::CODE_INTERNAL;
use herd_protocol::request::CODE_NOT_FOUND;

use crate::env::normalize_api_base;
use crate::error::HerdErr;
use crate::registry::InstanceRegistry;

pub async fn handle_request(registry: &InstanceRegistry, request: HerdRequest) -> HerdResponse {
    let request_id = request.request_id().cloned();
    let response = match dispatch(registry, request).await {
        Ok(data) => HerdResponse::ok(data),
        Err(err) => {
            let code = error_code(&err);
            if code == CODE_INTERNAL {
                tracing::warn!("request failed: {err}");
            }
            HerdResponse::error(code, err.to_string())
        }
    };
    response.with_request_id(request_id)
}

async fn dispatch(
    registry: &InstanceRegistry,
    request: HerdRequest,
) -> Result<Option<ResponseData>, HerdErr> {
    match request {
        HerdRequest::Create {
            agent_label,
            mut config,
            ..
        } => {
            normalize_api_base(&mut config);
            let instance = registry.create(agent_label, &config).await?;
            Ok(Some(ResponseData::Instance(Box::new(
                instance.snapshot().await,
            ))))
        }
        HerdRequest::Get { id, .. } => {
            let snapshot = registry.snapshot(id).await?;
            Ok(Some(ResponseData::Instance(Box::new(snapshot))))
        }
        HerdRequest::List { .. } => Ok(Some(ResponseData::Instances(
            registry.snapshots().await,
        ))),
        HerdRequest::Delete { id, .. } => {
            registry.delete(id).await?;
            Ok(None)
        }
        HerdRequest::Update {
            id, session_state, ..
        } => {
            let instance = registry.update(id, session_state).await?;
            Ok(Some(ResponseData::Instance(Box::new(
                instance.snapshot().await,
            ))))
        }
    }
}

/// Response code for a failed request.
pub fn error_code(err: &HerdErr) -> u16 {
    match err {
        HerdErr::NotFound { .. } => CODE_NOT_FOUND,
        HerdErr::InvalidTransition { .. } => CODE_BAD_REQUEST,
        HerdErr::Spawn { .. }
        | HerdErr::WorkerExited { .. }
        | HerdErr::ReadyTimeout { .. }
        | HerdErr::ChannelUnavailable
        | HerdErr::Control { .. }
        | HerdErr::Config { .. }
        | HerdErr::Io(_) => CODE_INTERNAL,
    }
}

/// Response for a line that could not be parsed as a request.
pub fn malformed_request(err: &serde_json::Error) -> HerdResponse {
    HerdResponse::error(CODE_BAD_REQUEST, format!("malformed request: {err}"))
}
