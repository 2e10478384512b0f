use anyhow::{anyhow, Result};
use base64::Engine as _;
use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::time::Duration;

use crate::config::Credentials;

pub const MAX_REQUEST_BYTES: usize = 10 * 1024;
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
}

impl HttpRequest {
    /// Path segments after the leading `/`. `"/"` yields one empty segment.
    pub fn segments(&self) -> Vec<&str> {
        self.path[1..].split('/').collect()
    }

    /// Whether a bare `name`, `name=1` or `name=true` appears in the query.
    pub fn query_flag(&self, name: &str) -> bool {
        let Some(query) = self.query.as_deref() else {
            return false;
        };
        query.split('&').any(|pair| match pair.split_once('=') {
            Some((key, value)) => {
                key == name && matches!(value.to_ascii_lowercase().as_str(), "" | "1" | "true")
            }
            None => pair == name,
        })
    }

    /// `(user, password)` from a Basic `Authorization` header.
    pub fn basic_auth(&self) -> Option<(String, String)> {
        let value = self.headers.get("authorization")?;
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some((user.to_string(), password.to_string()))
    }

    /// Exact match of both username and password.
    pub fn is_authorized(&self, credentials: &Credentials) -> bool {
        self.basic_auth().is_some_and(|(user, password)| {
            user == credentials.username && password == credentials.password
        })
    }
}

/// Read until the end of the header block. Filling the request buffer
/// without seeing `\r\n\r\n` is an error. Returns `None` if the peer closed
/// the connection before sending a full request.
pub fn read_request<S: Read>(stream: &mut S) -> Result<Option<HttpRequest>> {
    let mut buf = vec![0u8; MAX_REQUEST_BYTES];
    let mut len = 0;
    loop {
        let n = match stream.read(&mut buf[len..]) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        let scan_from = len.saturating_sub(3);
        len += n;
        if buf[scan_from..len].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if len == buf.len() {
            return Err(anyhow!("request exceeds {} bytes", MAX_REQUEST_BYTES));
        }
    }
    parse_request(&buf[..len]).map(Some)
}

pub fn parse_request(data: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or_default();
    let target = parts
        .next()
        .filter(|target| target.starts_with('/'))
        .ok_or_else(|| anyhow!("invalid request line: {}", request_line))?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        query,
        headers,
    })
}
