use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use uplift_core::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::get(url)
        }
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

pub trait HttpFetcher {
    /// Streams the response body into `dest`, reporting `(downloaded, total)`
    /// after every chunk. Returns the number of bytes written.
    fn download(
        &self,
        request: &HttpRequest,
        dest: &Path,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, FetchError>;

    fn request_json(&self, request: &HttpRequest) -> Result<Value, FetchError>;
}

pub struct ReqwestFetcher {
    client: Client,
    timeout: Duration,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("uplift/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| FetchError::Transport {
                url: String::new(),
                message: format!("failed to build http client: {err}"),
            })?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn send(&self, request: &HttpRequest) -> Result<Response, FetchError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        let response = builder
            .send()
            .map_err(|err| self.map_reqwest_error(&request.url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: request.url.clone(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    fn map_reqwest_error(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }

    fn map_read_error(&self, url: &str, err: std::io::Error) -> FetchError {
        let timed_out = err.kind() == std::io::ErrorKind::TimedOut
            || err
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                .is_some_and(reqwest::Error::is_timeout);
        if timed_out {
            FetchError::Timeout {
                url: url.to_string(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl HttpFetcher for ReqwestFetcher {
    fn download(
        &self,
        request: &HttpRequest,
        dest: &Path,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, FetchError> {
        let mut response = self.send(request)?;
        let total = response.content_length();
        let io_error = |source| FetchError::Io {
            path: dest.display().to_string(),
            source,
        };
        let mut writer = BufWriter::new(File::create(dest).map_err(io_error)?);

        let mut buffer = [0_u8; 64 * 1024];
        let mut downloaded = 0_u64;
        progress(0, total);
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| self.map_read_error(&request.url, err))?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read]).map_err(io_error)?;
            downloaded += read as u64;
            progress(downloaded, total);
        }
        writer.flush().map_err(io_error)?;
        Ok(downloaded)
    }

    fn request_json(&self, request: &HttpRequest) -> Result<Value, FetchError> {
        let response = self.send(request)?;
        let body = response
            .text()
            .map_err(|err| self.map_reqwest_error(&request.url, err))?;
        serde_json::from_str(&body).map_err(|err| FetchError::Transport {
            url: request.url.clone(),
            message: format!("response is not valid JSON: {err}"),
        })
    }
}
