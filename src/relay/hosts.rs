//! Public temporary file hosts used as relays.
//!
//! Two services are supported, each behind its own trait because their
//! protocols differ:
//!
//! - [`SmallFileHost`]: a single HTTP PUT, the response body is the URL
//!   (transfer.sh).
//! - [`LargeFileHost`]: ask a directory service for an upload server, then
//!   POST a multipart form there and read a JSON envelope (gofile.io).

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{Result, TransferError};

/// Upload-and-get-URL service for files under the small-file limit.
pub trait SmallFileHost: Send {
    /// Upload `local` under `name`; returns a URL the instance can fetch.
    fn upload(&self, local: &Path, name: &str) -> Result<String>;
}

/// Links returned by the large-file host for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LargeUpload {
    /// Human-facing download page.
    pub page_url: String,
    /// Host-assigned identifier.
    pub file_id: String,
    /// Direct link suitable for `curl -L`.
    pub direct_link: String,
}

/// Two-step upload service for files up to the large-file limit.
pub trait LargeFileHost: Send {
    /// Ask the directory service which server should take the upload.
    fn server(&self) -> Result<String>;
    /// Upload `local` to `server`.
    fn upload(&self, server: &str, local: &Path) -> Result<LargeUpload>;
}

fn relay_err(context: &str) -> impl Fn(reqwest::Error) -> TransferError + '_ {
    move |e| TransferError::Relay(format!("{context}: {e}"))
}

/// transfer.sh-style host: `PUT <base>/<name>`.
pub struct TransferShHost {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl TransferShHost {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(relay_err("http client"))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl SmallFileHost for TransferShHost {
    fn upload(&self, local: &Path, name: &str) -> Result<String> {
        let url = small_upload_url(&self.base_url, name);
        let file = File::open(local)?;
        let response = self
            .client
            .put(&url)
            .body(file)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(relay_err("small-file upload"))?;
        let body = response.text().map_err(relay_err("small-file response"))?;
        parse_small_upload_response(&body)
    }
}

/// Extract the download URL from a transfer.sh response body.
pub fn parse_small_upload_response(body: &str) -> Result<String> {
    let url = body.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.to_string())
    } else {
        Err(TransferError::Relay(format!(
            "small-file host returned no URL: {}",
            truncate(url, 200)
        )))
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ServerData {
    server: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadData {
    download_page: String,
    file_id: String,
    download_link: String,
}

fn open_envelope<'a, T: Deserialize<'a>>(body: &'a str, step: &str) -> Result<T> {
    let envelope: Envelope<T> = serde_json::from_str(body).map_err(|e| {
        TransferError::Relay(format!("large-file {step}: malformed response: {e}"))
    })?;
    if envelope.status != "ok" {
        return Err(TransferError::Relay(format!(
            "large-file {step}: status {}",
            envelope.status
        )));
    }
    envelope
        .data
        .ok_or_else(|| TransferError::Relay(format!("large-file {step}: response has no data")))
}

/// Parse the directory service's `getServer` response.
pub fn parse_server_response(body: &str) -> Result<String> {
    let data: ServerData = open_envelope(body, "server lookup")?;
    Ok(data.server)
}

/// Parse the upload server's `uploadFile` response.
pub fn parse_large_upload_response(body: &str) -> Result<LargeUpload> {
    let data: UploadData = open_envelope(body, "upload")?;
    Ok(LargeUpload {
        page_url: data.download_page,
        file_id: data.file_id,
        direct_link: data.download_link,
    })
}

/// gofile.io-style host.
pub struct GofileHost {
    api_url: String,
    client: reqwest::blocking::Client,
}

impl GofileHost {
    pub fn new(api_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(1800))
            .build()
            .map_err(relay_err("http client"))?;
        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl LargeFileHost for GofileHost {
    fn server(&self) -> Result<String> {
        let body = self
            .client
            .get(format!("{}/getServer", self.api_url))
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(relay_err("server lookup"))?;
        parse_server_response(&body)
    }

    fn upload(&self, server: &str, local: &Path) -> Result<LargeUpload> {
        let form = reqwest::blocking::multipart::Form::new().file("file", local)?;
        let body = self
            .client
            .post(format!("https://{server}.gofile.io/uploadFile"))
            .multipart(form)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(relay_err("large-file upload"))?;
        parse_large_upload_response(&body)
    }
}

/// `<base>/<name>` with `name` percent-encoded as one path segment.
pub fn small_upload_url(base_url: &str, name: &str) -> String {
    format!("{base_url}/{}", urlencoding::encode(name))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_small_upload_response() {
        assert_eq!(
            parse_small_upload_response("https://transfer.sh/abc/clip.mp4\n").unwrap(),
            "https://transfer.sh/abc/clip.mp4"
        );
        assert!(parse_small_upload_response("<html>rate limited</html>").is_err());
    }

    #[test]
    fn test_parse_server_response() {
        let body = r#"{"status":"ok","data":{"server":"store4"}}"#;
        assert_eq!(parse_server_response(body).unwrap(), "store4");

        let err = parse_server_response(r#"{"status":"error-rateLimit"}"#).unwrap_err();
        assert!(err.to_string().contains("error-rateLimit"));

        assert!(parse_server_response("not json").is_err());
    }

    #[test]
    fn test_parse_large_upload_response() {
        let body = r#"{"status":"ok","data":{
            "downloadPage":"https://gofile.io/d/Xy12",
            "fileId":"f-991",
            "downloadLink":"https://store4.gofile.io/download/f-991/big.tar.gz",
            "md5":"ignored"}}"#;
        let upload = parse_large_upload_response(body).unwrap();
        assert_eq!(upload.file_id, "f-991");
        assert_eq!(upload.page_url, "https://gofile.io/d/Xy12");
        assert!(upload.direct_link.ends_with("big.tar.gz"));

        let err = parse_large_upload_response(r#"{"status":"ok"}"#).unwrap_err();
        assert!(err.to_string().contains("no data"));
    }

    #[test]
    fn test_small_upload_url() {
        assert_eq!(
            small_upload_url("https://transfer.sh", "abc_1.tar.gz"),
            "https://transfer.sh/abc_1.tar.gz"
        );
        assert_eq!(
            small_upload_url("https://transfer.sh", "my clip#1.mp4"),
            "https://transfer.sh/my%20clip%231.mp4"
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
    }
}
