use std::io::{self, Write};

pub const MULTIPART_BOUNDARY: &str = "derpyderpderp";

/// Headers that let third-party dashboards and cast devices embed streams.
pub const CORS_HEADERS: &str = "Access-Control-Allow-Headers: DNT,User-Agent,X-Requested-With,If-Modified-Since,Cache-Control,Content-Type,Range\r\n\
Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
Access-Control-Allow-Origin: *\r\n\
Access-Control-Expose-Headers: *\r\n";

pub const FEED_NOT_FOUND: &str = "Feed not found";
pub const UNKNOWN_ACTION: &str = "Unknown action";
pub const SHUTDOWN_BODY: &str = "Server shut down";
const UNAUTHORIZED_BODY: &str = "Invalid username or password.";

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        401 => "HTTP/1.1 401 Unauthorized",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

/// A complete `Connection: Close` response with an HTML body.
pub fn write_html<W: Write>(out: &mut W, status: u16, body: &str) -> io::Result<()> {
    let head = format!(
        "{}\r\nConnection: Close\r\nContent-Type: text/html\r\n\r\n",
        status_line(status)
    );
    out.write_all(head.as_bytes())?;
    out.write_all(body.as_bytes())?;
    out.flush()
}

pub fn write_unauthorized<W: Write>(out: &mut W) -> io::Result<()> {
    let head = format!(
        "{}\r\nConnection: Close\r\nWWW-Authenticate: Basic realm=\"Camera HTTP Server\"\r\nContent-Type: text/html\r\n\r\n",
        status_line(401)
    );
    out.write_all(head.as_bytes())?;
    out.write_all(UNAUTHORIZED_BODY.as_bytes())?;
    out.flush()
}

/// Head of a streaming 200 response. `content_type` is written as its own
/// header line; the caller decides whether the head is terminated.
pub fn streaming_head(content_type: &str, terminate: bool) -> String {
    let mut head = format!(
        "{}\r\nConnection: Close\r\n{}Content-Type: {}\r\n",
        status_line(200),
        CORS_HEADERS,
        content_type
    );
    if terminate {
        head.push_str("\r\n");
    }
    head
}

pub fn write_snapshot<W: Write>(out: &mut W, jpeg: &[u8]) -> io::Result<()> {
    out.write_all(streaming_head("image/jpeg", true).as_bytes())?;
    out.write_all(jpeg)?;
    out.flush()
}
