use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// One contact as reported by the worker's contact listing.
///
/// Field names follow the worker's wire format. Fields the worker sends that
/// are not modelled here survive in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContactRecord {
    /// Per-session unique handle of the contact.
    pub user_name: String,
    pub nick_name: String,
    pub remark_name: String,
    pub display_name: String,
    pub alias: String,
    pub signature: String,
    pub head_img_url: String,
    pub city: String,
    pub province: String,
    pub sex: i64,
    pub contact_flag: i64,
    pub star_friend: i64,
    pub member_count: i64,
    pub member_list: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
