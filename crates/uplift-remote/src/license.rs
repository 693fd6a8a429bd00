use serde::{Deserialize, Serialize};
use serde_json::Value;
use uplift_core::{FetchError, LicenseConfig, OperationContext};

use crate::http::{HttpFetcher, HttpRequest};

pub const VERIFY_LICENSE_ENDPOINT: &str = "verify-license";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRequest {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl From<&LicenseConfig> for LicenseRequest {
    fn from(config: &LicenseConfig) -> Self {
        Self {
            key: config.key.clone(),
            email: config.email.clone(),
            name: config.name.clone(),
            domain: config.domain.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LicenseVerdict {
    pub valid: bool,
    pub details: Value,
}

pub struct LicenseVerifier<'a> {
    http: &'a dyn HttpFetcher,
}

impl<'a> LicenseVerifier<'a> {
    pub fn new(http: &'a dyn HttpFetcher) -> Self {
        Self { http }
    }

    pub fn verify(
        &self,
        ctx: &mut OperationContext,
        license: &LicenseRequest,
    ) -> Result<LicenseVerdict, FetchError> {
        let url = format!(
            "{}/{VERIFY_LICENSE_ENDPOINT}",
            ctx.config().update_base_url.trim_end_matches('/')
        );
        let body = serde_json::to_value(license).map_err(|err| FetchError::Transport {
            url: url.clone(),
            message: format!("failed encoding license request: {err}"),
        })?;
        let details = match self.http.request_json(&HttpRequest::post(url).with_json(body)) {
            Ok(details) => details,
            Err(err) => {
                ctx.error(format!("License verification failed: {err}"));
                return Err(err);
            }
        };

        let valid = verdict_flag(&details);
        if valid {
            ctx.info("License verified successfully");
        } else {
            ctx.warn("License verification was rejected by the update server");
        }
        Ok(LicenseVerdict { valid, details })
    }
}

// Servers answer with one of `valid`, `success` or `status` as the verdict.
fn verdict_flag(details: &Value) -> bool {
    ["valid", "success", "status"]
        .iter()
        .find_map(|key| details.get(key).and_then(Value::as_bool))
        .unwrap_or(false)
}
