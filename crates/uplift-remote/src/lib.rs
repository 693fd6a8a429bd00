mod check;
mod fetch;
mod http;
mod license;

pub use check::{UpdateCheck, UpdateChecker, UPDATES_ENDPOINT};
pub use fetch::{license_headers, ArchiveFetcher};
pub use http::{HttpFetcher, HttpMethod, HttpRequest, ReqwestFetcher};
pub use license::{LicenseRequest, LicenseVerdict, LicenseVerifier, VERIFY_LICENSE_ENDPOINT};
