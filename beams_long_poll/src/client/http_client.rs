//! HTTP client seam for the long-poll client.
//!
//! The client state machine only needs a long GET and a form POST, so any
//! HTTP stack (or a scripted fake in tests) can drive it.

use futures::future::BoxFuture;

/// A minimal async HTTP client.
pub trait HttpClient: Clone + Send + Sync + 'static {
    /// The error type for HTTP operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send an HTTP GET request and return the response.
    fn get(&self, url: &str) -> BoxFuture<'_, Result<HttpResponse, Self::Error>>;

    /// Send an HTTP POST request and return the response.
    fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> BoxFuture<'_, Result<HttpResponse, Self::Error>>;
}

/// A minimal HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: u16,

    /// The response body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Create a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Whether the status is exactly 200.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// The reqwest client could not be built or a request failed.
#[cfg(feature = "reqwest")]
#[derive(Debug, thiserror::Error)]
#[error("reqwest: {0}")]
pub struct ReqwestHttpError(#[from] reqwest::Error);

/// A [`reqwest`]-backed [`HttpClient`].
#[cfg(feature = "reqwest")]
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
}

#[cfg(feature = "reqwest")]
impl ReqwestHttpClient {
    /// Build a client whose requests give up after `request_timeout`.
    ///
    /// The timeout must outlast the server's idle window, or held polls are
    /// cut short and counted as failures.
    ///
    /// # Errors
    ///
    /// Returns [`ReqwestHttpError`] if the TLS backend cannot be initialised.
    pub fn new(request_timeout: core::time::Duration) -> Result<Self, ReqwestHttpError> {
        let inner = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { inner })
    }
}

#[cfg(feature = "reqwest")]
fn send(
    request: reqwest::RequestBuilder,
) -> BoxFuture<'static, Result<HttpResponse, ReqwestHttpError>> {
    use futures::FutureExt;

    async move {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }
    .boxed()
}

#[cfg(feature = "reqwest")]
impl From<reqwest::Client> for ReqwestHttpClient {
    fn from(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

#[cfg(feature = "reqwest")]
impl HttpClient for ReqwestHttpClient {
    type Error = ReqwestHttpError;

    fn get(&self, url: &str) -> BoxFuture<'_, Result<HttpResponse, Self::Error>> {
        send(self.inner.get(url))
    }

    fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> BoxFuture<'_, Result<HttpResponse, Self::Error>> {
        let request = headers
            .iter()
            .fold(self.inner.post(url), |request, &(name, value)| {
                request.header(name, value)
            });
        send(request.body(body))
    }
}
