use std::collections::HashMap;
use std::path::Path;

use serde_json::Map;
use serde_json::Value;

/// Env var through which the worker learns where to bind its control socket.
pub const CONTROL_ADDRESS_ENV_VAR: &str = "UNIX_SOCKET_PATH";

const API_BASE_KEY: &str = "open_ai_api_base";
const API_BASE_SUFFIX: &str = "/v1";

/// Flattens an instance config into the worker's environment.
pub fn encode_env(config: &Map<String, Value>, control_address: &Path) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = config
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value)))
        .collect();
    env.insert(
        CONTROL_ADDRESS_ENV_VAR.to_string(),
        control_address.display().to_string(),
    );
    env
}

fn encode_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(encode_value)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => value.to_string(),
    }
}

/// Makes sure an OpenAI-compatible base URL ends with `/v1`.
pub fn normalize_api_base(config: &mut Map<String, Value>) {
    if let Some(Value::String(base)) = config.get_mut(API_BASE_KEY) {
        let trimmed = base.trim_end_matches('/');
        let normalized = if trimmed.ends_with(API_BASE_SUFFIX) {
            trimmed.to_string()
        } else {
            format!("{trimmed}{API_BASE_SUFFIX}")
        };
        *base = normalized;
    }
}
