use serde::{Deserialize, Serialize};

use crate::{AuthorizationPolicy, FieldMap, FieldValue, TransportResult};

/// State reported for every shaped response
pub const SUCCESS_STATE: &str = "SUCCESS";

/// Uniform completion record.
///
/// The storage backend answers an accepted upload with an empty body, so the
/// record is built from the form fields the caller supplied and the object URL
/// from the policy rather than from anything the backend returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<FieldValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<FieldValue>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<FieldValue>,

    #[serde(rename = "lastModifiedDate", default, skip_serializing_if = "Option::is_none")]
    pub last_modified_date: Option<FieldValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FieldValue>,

    pub state: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl NormalizedResponse {
    /// Build the record. Without a policy the `url` stays absent.
    pub fn shape(fields: &FieldMap, policy: Option<&AuthorizationPolicy>) -> Self {
        let field = |key: &str| fields.get(key).cloned();
        Self {
            name: field("name"),
            size: field("size"),
            content_type: field("type"),
            last_modified_date: field("lastModifiedDate"),
            id: field("id"),
            state: SUCCESS_STATE.to_string(),
            url: policy.and_then(|p| p.url.clone()),
        }
    }

    /// JSON text; numeric fields stay unquoted
    pub fn to_json_string(&self) -> TransportResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
