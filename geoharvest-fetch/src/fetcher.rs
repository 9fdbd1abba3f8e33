use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempPath;

use crate::FetchError;

/// `(stem, extension)` pair naming one upstream file, e.g. `("GB", ".zip")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    pub stem: String,
    pub extension: String,
}

impl FetchTarget {
    pub fn new(stem: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            stem: stem.into(),
            extension: extension.into(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.stem, self.extension)
    }
}

#[derive(Debug)]
pub enum TransportKind {
    Timeout,
    ConnectionRefused,
    Other(String),
}

/// Classified result of a single conditional GET.
#[derive(Debug)]
pub enum FetchOutcome {
    /// HTTP 200; the body has been streamed to `temp_path`. `etag` is
    /// absent when the server omits the header.
    Fresh {
        target: FetchTarget,
        etag: Option<String>,
        temp_path: TempPath,
    },
    /// HTTP 304; the on-disk copy is still valid.
    Unchanged { target: FetchTarget },
    /// Any other HTTP status.
    HttpError {
        target: FetchTarget,
        status: reqwest::StatusCode,
        description: String,
    },
    TransportError {
        target: FetchTarget,
        kind: TransportKind,
    },
}

pub struct Fetcher {
    client: reqwest::Client,
    base_url: String,
    staging_dir: PathBuf,
}

impl Fetcher {
    pub fn new(
        base_url: String,
        proxy: Option<(String, u16)>,
        timeout: Duration,
        staging_dir: PathBuf,
    ) -> Result<Self, FetchError> {
        let mut builder = reqwest::ClientBuilder::new().timeout(timeout);
        if let Some((host, port)) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(format!("http://{host}:{port}"))?);
        }
        Ok(Self {
            client: builder.build()?,
            base_url,
            staging_dir,
        })
    }

    /// Issue one conditional GET and classify the outcome. Never retries.
    ///
    /// The body is streamed chunk-by-chunk into a temp file inside the
    /// target directory; country archives are tens of MB and are never
    /// buffered in memory. Header-name matching is case-insensitive, the
    /// validator value itself is kept byte-exact.
    pub async fn fetch(&self, target: FetchTarget, prior_etag: Option<&str>) -> FetchOutcome {
        let url = format!("{}{}", self.base_url, target.file_name());
        let mut request = self.client.get(&url);
        if let Some(etag) = prior_etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        tracing::debug!(%url, conditional = prior_etag.is_some(), "GET");

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return FetchOutcome::TransportError {
                    target,
                    kind: classify(&e),
                }
            }
        };

        match response.status() {
            reqwest::StatusCode::OK => {}
            reqwest::StatusCode::NOT_MODIFIED => return FetchOutcome::Unchanged { target },
            status => {
                return FetchOutcome::HttpError {
                    target,
                    status,
                    description: status
                        .canonical_reason()
                        .unwrap_or("unrecognized status")
                        .to_owned(),
                }
            }
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let mut file = match tempfile::NamedTempFile::new_in(&self.staging_dir) {
            Ok(file) => file,
            Err(e) => {
                return FetchOutcome::TransportError {
                    target,
                    kind: TransportKind::Other(format!("staging temp file: {e}")),
                }
            }
        };

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    return FetchOutcome::TransportError {
                        target,
                        kind: classify(&e),
                    }
                }
            };
            if let Err(e) = file.write_all(&chunk) {
                return FetchOutcome::TransportError {
                    target,
                    kind: TransportKind::Other(format!("write body: {e}")),
                };
            }
        }

        FetchOutcome::Fresh {
            target,
            etag,
            temp_path: file.into_temp_path(),
        }
    }
}

fn classify(error: &reqwest::Error) -> TransportKind {
    if error.is_timeout() {
        TransportKind::Timeout
    } else if error.is_connect() {
        TransportKind::ConnectionRefused
    } else {
        TransportKind::Other(error.to_string())
    }
}
