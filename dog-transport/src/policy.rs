use serde::{Deserialize, Serialize};

use crate::{FieldMap, FieldValue};

/// Signed upload policy issued by the authorization endpoint.
///
/// Immutable once received; one per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationPolicy {
    /// Upload server the form is posted to
    #[serde(rename = "server", default)]
    pub upload_server: String,

    #[serde(rename = "OSSAccessKeyId")]
    pub access_key_id: String,

    /// Base64 policy document
    pub policy: String,

    #[serde(rename = "Signature")]
    pub signature: String,

    /// Object key the backend stores the upload under
    #[serde(rename = "key")]
    pub object_key: String,

    /// Status code the backend answers with on success
    #[serde(rename = "success_action_status")]
    pub success_status: FieldValue,

    /// Public URL of the stored object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl AuthorizationPolicy {
    /// Form fields the backend requires, merged over whatever is already there
    pub fn apply_to(&self, fields: &mut FieldMap) {
        fields.set("OSSAccessKeyId", self.access_key_id.as_str());
        fields.set("policy", self.policy.as_str());
        fields.set("Signature", self.signature.as_str());
        fields.set("key", self.object_key.as_str());
        fields.set("success_action_status", self.success_status.clone());
    }

    pub fn success_status_code(&self) -> Option<u16> {
        self.success_status.as_u64().and_then(|s| u16::try_from(s).ok())
    }
}

/// Names of the fields a policy contributes
pub const POLICY_FIELDS: [&str; 5] = [
    "OSSAccessKeyId",
    "policy",
    "Signature",
    "key",
    "success_action_status",
];

/// Object key requested for a given filename
pub fn object_key_for(filename: &str) -> String {
    format!("/{}", filename)
}
