use std::fs;
use std::path::PathBuf;

use uplift_core::{is_suspicious_path, FetchError, LicenseConfig, OperationContext};
use uplift_security::verify_sha256_file;

use crate::http::{HttpFetcher, HttpRequest};

/// Downloads update artifacts from `<update_base_url>/<archive>` into the
/// download directory.
pub struct ArchiveFetcher<'a> {
    http: &'a dyn HttpFetcher,
}

impl<'a> ArchiveFetcher<'a> {
    pub fn new(http: &'a dyn HttpFetcher) -> Self {
        Self { http }
    }

    pub fn fetch(
        &self,
        ctx: &mut OperationContext,
        archive: &str,
        expected_sha256: Option<&str>,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<PathBuf, FetchError> {
        let url = format!(
            "{}/{}",
            ctx.config().update_base_url.trim_end_matches('/'),
            archive.trim_start_matches('/')
        );
        let file_name = archive
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .filter(|_| !is_suspicious_path(archive))
            .ok_or_else(|| FetchError::Transport {
                url: url.clone(),
                message: format!("refusing archive name '{archive}'"),
            })?;

        let download_dir = ctx.layout().download_dir();
        fs::create_dir_all(&download_dir).map_err(|source| FetchError::Io {
            path: download_dir.display().to_string(),
            source,
        })?;
        let dest = download_dir.join(file_name);
        let part = download_dir.join(format!("{file_name}.part"));

        ctx.info(format!("Downloading update from: {url}"));
        let headers = ctx
            .config()
            .license
            .as_ref()
            .map(license_headers)
            .unwrap_or_default();
        let request = HttpRequest::get(url).with_headers(headers);
        if let Err(err) = self.http.download(&request, &part, progress) {
            let _ = fs::remove_file(&part);
            ctx.error(format!("Download failed: {err}"));
            return Err(err);
        }

        if let Some(expected) = expected_sha256 {
            let verified = verify_sha256_file(&part, expected).map_err(|err| FetchError::Io {
                path: part.display().to_string(),
                source: std::io::Error::other(format!("{err:#}")),
            });
            match verified {
                Ok((true, _)) => ctx.info("Download checksum verified"),
                Ok((false, actual)) => {
                    let _ = fs::remove_file(&part);
                    let err = FetchError::Checksum {
                        path: dest.display().to_string(),
                        expected: expected.to_ascii_lowercase(),
                        actual,
                    };
                    ctx.error(format!("Download failed: {err}"));
                    return Err(err);
                }
                Err(err) => {
                    let _ = fs::remove_file(&part);
                    ctx.error(format!("Download failed: {err}"));
                    return Err(err);
                }
            }
        }

        if dest.exists() {
            let _ = fs::remove_file(&dest);
        }
        fs::rename(&part, &dest).map_err(|source| FetchError::Io {
            path: dest.display().to_string(),
            source,
        })?;
        ctx.info("Download successful");
        Ok(dest)
    }
}

pub fn license_headers(license: &LicenseConfig) -> Vec<(String, String)> {
    let mut headers = vec![("X-License-Key".to_string(), license.key.clone())];
    for (name, value) in [
        ("X-License-Name", &license.name),
        ("X-License-Email", &license.email),
        ("X-Domain", &license.domain),
    ] {
        if let Some(value) = value {
            headers.push((name.to_string(), value.clone()));
        }
    }
    headers
}
