use uplift_core::{is_newer_version, CheckMethod, FetchError, OperationContext, UpdateManifest};

use crate::fetch::license_headers;
use crate::http::{HttpFetcher, HttpRequest};

pub const UPDATES_ENDPOINT: &str = "updates.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    Available(UpdateManifest),
    UpToDate { advertised: Option<String> },
    Disabled,
}

pub struct UpdateChecker<'a> {
    http: &'a dyn HttpFetcher,
}

impl<'a> UpdateChecker<'a> {
    pub fn new(http: &'a dyn HttpFetcher) -> Self {
        Self { http }
    }

    /// Queries `<update_base_url>/updates.json` with the configured method,
    /// identifying the installation when a license is configured.
    pub fn check(
        &self,
        ctx: &mut OperationContext,
        current_version: &str,
    ) -> Result<UpdateCheck, FetchError> {
        if !ctx.config().online_check {
            ctx.info("Online update check is disabled");
            return Ok(UpdateCheck::Disabled);
        }
        ctx.info(format!(
            "Checking for updates. Current version: {current_version}"
        ));
        let url = format!(
            "{}/{UPDATES_ENDPOINT}",
            ctx.config().update_base_url.trim_end_matches('/')
        );
        let headers = ctx
            .config()
            .license
            .as_ref()
            .map(license_headers)
            .unwrap_or_default();

        let request = match ctx.config().check_method {
            CheckMethod::Get => HttpRequest::get(&url),
            CheckMethod::Post => HttpRequest::post(&url),
        }
        .with_headers(headers);
        let body = match self.http.request_json(&request) {
            Ok(body) => body,
            Err(err) => {
                ctx.error(format!("Failed to check for updates: {err}"));
                return Err(err);
            }
        };

        let manifest: UpdateManifest =
            serde_json::from_value(body).map_err(|err| FetchError::Transport {
                url,
                message: format!("update response is not a manifest: {err}"),
            })?;
        if manifest.has_version() && is_newer_version(&manifest.version, current_version) {
            ctx.info(format!("New version available: {}", manifest.version));
            return Ok(UpdateCheck::Available(manifest));
        }

        ctx.info("No updates available");
        Ok(UpdateCheck::UpToDate {
            advertised: manifest.has_version().then(|| manifest.version.clone()),
        })
    }
}
