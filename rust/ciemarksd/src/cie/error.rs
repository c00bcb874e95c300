use super::types::{BundleKey, LockReason};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CieError {
    #[error("{message}")]
    Validation {
        key: Option<BundleKey>,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Write or transition attempted against a bundle whose aggregate forbids it.
    #[error("bundle {key} is locked: {reason}")]
    BundleLocked { key: BundleKey, reason: LockReason },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("{message}")]
    Unauthorized {
        key: Option<BundleKey>,
        message: String,
    },

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl CieError {
    pub fn validation(key: Option<&BundleKey>, message: impl Into<String>) -> Self {
        CieError::Validation {
            key: key.cloned(),
            message: message.into(),
            details: None,
        }
    }

    pub fn locked(key: &BundleKey, reason: LockReason) -> Self {
        CieError::BundleLocked {
            key: key.clone(),
            reason,
        }
    }

    pub fn unauthorized(key: Option<&BundleKey>, message: impl Into<String>) -> Self {
        CieError::Unauthorized {
            key: key.cloned(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CieError::Validation { .. } => "validation_error",
            CieError::BundleLocked { .. } => "bundle_locked",
            CieError::NotFound { .. } => "not_found",
            CieError::Unauthorized { .. } => "unauthorized",
            CieError::Db(_) => "db_query_failed",
        }
    }

    /// Bundle identity plus whatever the caller needs to pick a next step.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            CieError::Validation { key, details, .. } => {
                let mut out = key.as_ref().map(BundleKey::details).unwrap_or_else(|| json!({}));
                if let (Some(obj), Some(serde_json::Value::Object(extra))) =
                    (out.as_object_mut(), details.as_ref())
                {
                    for (k, v) in extra {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                if out.as_object().map(|o| o.is_empty()).unwrap_or(true) {
                    None
                } else {
                    Some(out)
                }
            }
            CieError::BundleLocked { key, reason } => {
                let mut out = key.details();
                out["reason"] = json!(reason.as_str());
                Some(out)
            }
            CieError::NotFound { what, id } => Some(json!({ "kind": what, "id": id })),
            CieError::Unauthorized { key, .. } => key.as_ref().map(BundleKey::details),
            CieError::Db(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cie::types::AssessmentSlot;

    #[test]
    fn locked_error_names_reason() {
        let key = BundleKey::new("s1", AssessmentSlot::Cie2);
        let e = CieError::locked(&key, LockReason::AwaitingReview);
        assert_eq!(e.code(), "bundle_locked");
        assert_eq!(e.to_string(), "bundle s1/CIE2 is locked: awaiting review");
        let d = e.details().expect("details");
        assert_eq!(d["reason"], "awaiting review");
        assert_eq!(d["subjectId"], "s1");
        assert_eq!(d["slot"], "CIE2");
    }

    #[test]
    fn validation_details_merge_bundle_identity() {
        let key = BundleKey::new("s1", AssessmentSlot::Cie1);
        let e = CieError::Validation {
            key: Some(key),
            message: "incomplete".into(),
            details: Some(json!({ "missing": ["st1"] })),
        };
        let d = e.details().expect("details");
        assert_eq!(d["slot"], "CIE1");
        assert_eq!(d["missing"], json!(["st1"]));
        assert!(CieError::validation(None, "x").details().is_none());
    }
}
