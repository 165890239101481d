//! HTTP Client
//!
//! Node-style `http` module backed by a small blocking HTTP/1.1 client. The
//! request runs on the worker pool; the callback gets the response on the
//! event loop.
//!
//! # Example
//! ```text
//! http.get("http://localhost:8080/status", (err, res) => {
//!   console.log(res.status, res.text());
//! });
//! ```
//!
//! Plain `http://` only. TLS is not provided.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap as HashMap;

use crate::error::{Error, Result};
use crate::event_loop::TaskHandle;
use crate::runtime::HostContext;

/// HTTP Method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            other => Err(Error::http(format!("unsupported method: {}", other))),
        }
    }
}

/// HTTP Headers, names compared case-insensitively
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    headers: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_lowercase(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_lowercase())
    }

    pub fn remove(&mut self, name: &str) {
        self.headers.remove(&name.to_lowercase());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.headers.iter()
    }
}

/// HTTP Request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: &str) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_json<T: serde::Serialize>(mut self, value: &T) -> Result<Self> {
        let json = serde_json::to_vec(value)
            .map_err(|e| Error::http(format!("failed to encode body: {}", e)))?;
        self.headers.set("content-type", "application/json");
        self.body = Some(json);
        Ok(self)
    }
}

/// HTTP Response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, status_text: &str) -> Self {
        Self {
            status,
            status_text: status_text.to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Whether the status is in the 2xx range
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::http(format!("response is not valid JSON: {}", e)))
    }
}

// ---------------------------------------------------------------------------
// URL parsing
// ---------------------------------------------------------------------------

/// The pieces of an `http://` URL the client needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Url {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let invalid = || Error::InvalidUrl(url.to_string());

        let (scheme, rest) = if let Some(r) = url.strip_prefix("https://") {
            ("https", r)
        } else if let Some(r) = url.strip_prefix("http://") {
            ("http", r)
        } else {
            return Err(invalid());
        };

        let (host_port, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };

        let (host, port) = match host_port.rfind(':') {
            Some(colon) => {
                let port: u16 = host_port[colon + 1..].parse().map_err(|_| invalid())?;
                (&host_port[..colon], port)
            }
            None => (host_port, if scheme == "https" { 443 } else { 80 }),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// Value for the `host` header; the port is omitted only when it is
    /// the scheme's default
    pub fn host_header(&self) -> String {
        let default_port = if self.scheme == "https" { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Blocking HTTP/1.1 client. One connection per request.
#[derive(Debug, Clone)]
pub struct HttpClient {
    default_headers: Headers,
    timeout: Duration,
}

impl HttpClient {
    pub fn new() -> Self {
        let mut default_headers = Headers::new();
        default_headers.set("user-agent", &format!("Tidepool/{}", crate::VERSION));

        Self {
            default_headers,
            timeout: Duration::from_secs(30),
        }
    }

    /// Connect and read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Make an HTTP request
    pub fn request(&self, req: &Request) -> Result<Response> {
        let url = Url::parse(&req.url)?;
        if url.scheme != "http" {
            return Err(Error::http(format!("{} is not supported: {}", url.scheme, req.url)));
        }

        let addr = (url.host.as_str(), url.port)
            .to_socket_addrs()
            .map_err(|e| Error::http(format!("DNS resolution failed for {}: {}", url.host, e)))?
            .next()
            .ok_or_else(|| Error::http(format!("no addresses found for {}", url.host)))?;

        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| Error::http(format!("connection to {} failed: {}", addr, e)))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut head = format!(
            "{} {} HTTP/1.1\r\nhost: {}\r\n",
            req.method.as_str(),
            url.path,
            url.host_header()
        );
        for (name, value) in self.default_headers.iter() {
            if !req.headers.has(name) {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        for (name, value) in req.headers.iter() {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if let Some(ref body) = req.body {
            head.push_str(&format!("content-length: {}\r\n", body.len()));
        }
        head.push_str("connection: close\r\n\r\n");

        stream.write_all(head.as_bytes())?;
        if let Some(ref body) = req.body {
            stream.write_all(body)?;
        }
        stream.flush()?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;
        tracing::trace!(url = %req.url, bytes = raw.len(), "http response read");
        parse_response(&raw, req.method == Method::Head)
    }

    /// Convenience method for GET requests
    pub fn get(&self, url: &str) -> Result<Response> {
        self.request(&Request::get(url))
    }

    /// Convenience method for POST requests
    pub fn post(&self, url: &str, body: &str) -> Result<Response> {
        self.request(&Request::post(url).with_body(body.as_bytes().to_vec()))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a complete HTTP/1.1 response read until connection close
fn parse_response(raw: &[u8], head_only: bool) -> Result<Response> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| Error::http("truncated response head"))?;
    let head = std::str::from_utf8(&raw[..split])
        .map_err(|_| Error::http("response head is not valid UTF-8"))?;
    let rest = &raw[split + 4..];

    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or_else(|| Error::http("empty response"))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(Error::http(format!("invalid status line: {}", status_line)));
    }
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::http(format!("invalid status code: {}", status_line)))?;

    let mut response = Response::new(status, parts.next().unwrap_or_default());
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            response.headers.set(name.trim(), value.trim());
        }
    }

    if head_only || status == 204 || status == 304 {
        return Ok(response);
    }

    let chunked = response
        .headers
        .get("transfer-encoding")
        .is_some_and(|te| te.eq_ignore_ascii_case("chunked"));
    response.body = if chunked {
        decode_chunked(rest)?
    } else if let Some(length) = response.headers.get("content-length") {
        let length: usize = length
            .parse()
            .map_err(|_| Error::http(format!("invalid content-length: {}", length)))?;
        if rest.len() < length {
            return Err(Error::http(format!(
                "body truncated: expected {} bytes, got {}",
                length,
                rest.len()
            )));
        }
        rest[..length].to_vec()
    } else {
        rest.to_vec()
    };

    Ok(response)
}

fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| Error::http("truncated chunk header"))?;
        let size_line = std::str::from_utf8(&data[..line_end])
            .map_err(|_| Error::http("invalid chunk header"))?;
        // chunk extensions follow a ';'
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| Error::http(format!("invalid chunk size: {}", size_hex)))?;
        data = &data[line_end + 2..];

        if size == 0 {
            return Ok(body);
        }
        if data.len() < size + 2 {
            return Err(Error::http("truncated chunk"));
        }
        body.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

// ---------------------------------------------------------------------------
// Async module
// ---------------------------------------------------------------------------

/// The `http` built-in module
#[derive(Debug, Clone)]
pub struct HttpModule {
    context: HostContext,
    client: Arc<HttpClient>,
}

impl HttpModule {
    pub fn new(context: HostContext) -> Self {
        Self::with_client(context, HttpClient::new())
    }

    pub fn with_client(context: HostContext, client: HttpClient) -> Self {
        Self {
            context,
            client: Arc::new(client),
        }
    }

    /// `http.request(options, cb)`
    pub fn request<C>(&self, request: Request, callback: C) -> TaskHandle
    where
        C: FnOnce(Result<Response>) -> Result<()> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        self.context
            .spawn_blocking("http.request", move || client.request(&request), callback)
    }

    /// `http.get(url, cb)`
    pub fn get<C>(&self, url: &str, callback: C) -> TaskHandle
    where
        C: FnOnce(Result<Response>) -> Result<()> + Send + 'static,
    {
        self.request(Request::get(url), callback)
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }
}
