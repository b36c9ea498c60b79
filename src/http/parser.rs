//! HTTP/1.x message head parsing
//!
//! Parsers are incremental: feed bytes as they arrive and they return the
//! parsed head once the blank line is seen. Bytes after the head belong to
//! the body and are available through `take_remaining`.

use super::{Error, Headers, Method, Result, Status, Version};

/// Upper bound for a message head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Find the next line ending, accepting bare LF
///
/// Returns the line length without terminator and the terminator length.
fn find_line(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.iter().position(|&b| b == b'\n')?;
    if lf > 0 && buf[lf - 1] == b'\r' {
        Some((lf - 1, 2))
    } else {
        Some((lf, 1))
    }
}

/// Parse HTTP request line
///
/// Format: METHOD TARGET VERSION\r\n
/// Example: GET /index.html HTTP/1.1\r\n
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() != 3 {
        return Err(Error::Parse(format!(
            "Invalid request line: expected 3 parts, got {}",
            parts.len()
        )));
    }

    let method = Method::from_str(parts[0])?;
    let target = parts[1].to_string();
    let version = Version::from_str(parts[2])?;

    Ok((method, target, version))
}

/// Parse HTTP response status line
///
/// Format: VERSION STATUS REASON\r\n
/// Example: HTTP/1.1 200 OK\r\n
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    if parts.len() < 2 {
        return Err(Error::Parse(format!(
            "Invalid status line: expected at least 2 parts, got {}",
            parts.len()
        )));
    }

    let version = match Version::from_str(parts[0])? {
        Version::Http2 => return Err(Error::InvalidVersion(parts[0].to_string())),
        v => v,
    };
    let status_code = parts[1]
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("Invalid status code: {}", parts[1])))?;
    let status = Status::new(status_code)?;
    let reason = if parts.len() == 3 {
        parts[2].to_string()
    } else {
        status.reason_phrase().to_string()
    };

    Ok((version, status, reason))
}

/// Parsed response status line and headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: Status,
    pub reason: String,
    pub headers: Headers,
}

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    StartLine,
    Headers,
    Complete,
}

/// Shared line splitting for both parsers
#[derive(Debug)]
struct HeadReader {
    state: ParserState,
    buffer: Vec<u8>,
    headers: Headers,
}

impl HeadReader {
    fn new() -> Self {
        HeadReader {
            state: ParserState::StartLine,
            buffer: Vec::new(),
            headers: Headers::new(),
        }
    }

    fn next_line(&mut self) -> Option<String> {
        let (len, term) = find_line(&self.buffer)?;
        let line = String::from_utf8_lossy(&self.buffer[..len]).into_owned();
        self.buffer.drain(..len + term);
        Some(line)
    }

    /// Consume header lines; true once the blank line was seen
    fn read_headers(&mut self) -> Result<bool> {
        while let Some(line) = self.next_line() {
            if line.is_empty() {
                self.state = ParserState::Complete;
                return Ok(true);
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                return Err(Error::InvalidHeader("obsolete line folding".to_string()));
            }
            let (name, value) = Headers::parse_header_line(&line)?;
            self.headers.insert(name, value);
            self.headers.check_limit()?;
        }
        self.check_size()?;
        Ok(false)
    }

    fn check_size(&self) -> Result<()> {
        if self.buffer.len() > MAX_HEAD_SIZE {
            return Err(Error::Parse("message head too large".to_string()));
        }
        Ok(())
    }
}

/// HTTP response head parser
#[derive(Debug)]
pub struct ResponseParser {
    reader: HeadReader,
    status_line: Option<(Version, Status, String)>,
}

impl ResponseParser {
    /// Create a new response parser
    pub fn new() -> Self {
        ResponseParser {
            reader: HeadReader::new(),
            status_line: None,
        }
    }

    /// Feed data to the parser
    ///
    /// Returns Ok(Some(head)) when the head is complete,
    /// Ok(None) if more data is needed, or Err on parse error.
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<ResponseHead>> {
        self.reader.buffer.extend_from_slice(data);

        if self.reader.state == ParserState::StartLine {
            let Some(line) = self.reader.next_line() else {
                self.reader.check_size()?;
                return Ok(None);
            };
            self.status_line = Some(parse_status_line(&line)?);
            self.reader.state = ParserState::Headers;
        }

        if self.reader.state == ParserState::Headers && self.reader.read_headers()? {
            let Some((version, status, reason)) = self.status_line.take() else {
                return Err(Error::Incomplete);
            };
            return Ok(Some(ResponseHead {
                version,
                status,
                reason,
                headers: std::mem::take(&mut self.reader.headers),
            }));
        }
        Ok(None)
    }

    /// Bytes received after the head
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.reader.buffer)
    }

    /// Reset the parser for the next head, keeping unconsumed bytes
    pub fn reset(&mut self) {
        self.reader.state = ParserState::StartLine;
        self.reader.headers = Headers::new();
        self.status_line = None;
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP request head parser
#[derive(Debug)]
pub struct RequestParser {
    reader: HeadReader,
    request_line: Option<(Method, String, Version)>,
}

impl RequestParser {
    /// Create a new request parser
    pub fn new() -> Self {
        RequestParser {
            reader: HeadReader::new(),
            request_line: None,
        }
    }

    /// Feed data to the parser
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<RequestHead>> {
        self.reader.buffer.extend_from_slice(data);

        if self.reader.state == ParserState::StartLine {
            // Tolerate empty lines between pipelined requests
            loop {
                let Some(line) = self.reader.next_line() else {
                    self.reader.check_size()?;
                    return Ok(None);
                };
                if !line.is_empty() {
                    self.request_line = Some(parse_request_line(&line)?);
                    break;
                }
            }
            self.reader.state = ParserState::Headers;
        }

        if self.reader.state == ParserState::Headers && self.reader.read_headers()? {
            let Some((method, target, version)) = self.request_line.take() else {
                return Err(Error::Incomplete);
            };
            return Ok(Some(RequestHead {
                method,
                target,
                version,
                headers: std::mem::take(&mut self.reader.headers),
            }));
        }
        Ok(None)
    }

    /// Bytes received after the head
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.reader.buffer)
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let (method, target, version) = parse_request_line("GET /index.html HTTP/1.1").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(target, "/index.html");
        assert_eq!(version, Version::Http11);
    }

    #[test]
    fn test_parse_status_line() {
        let (version, status, reason) = parse_status_line("HTTP/1.1 200 OK").unwrap();
        assert_eq!(version, Version::Http11);
        assert_eq!(status.code(), 200);
        assert_eq!(reason, "OK");

        // Test without reason phrase
        let (version, status, reason) = parse_status_line("HTTP/1.0 404").unwrap();
        assert_eq!(version, Version::Http10);
        assert_eq!(status.code(), 404);
        assert_eq!(reason, "Not Found");

        assert!(parse_status_line("HTTP/2 200 OK").is_err());
        assert!(parse_status_line("garbage").is_err());
    }

    #[test]
    fn test_response_parser_keeps_body_bytes() {
        let mut parser = ResponseParser::new();

        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHello";
        let head = parser.parse(data).unwrap().unwrap();

        assert_eq!(head.status.code(), 200);
        assert_eq!(head.headers.get("Content-Length"), Some("5"));
        assert_eq!(parser.take_remaining(), b"Hello");
    }

    #[test]
    fn test_response_parser_incremental() {
        let mut parser = ResponseParser::new();

        // Feed data incrementally
        assert!(parser.parse(b"HTTP/1.1 ").unwrap().is_none());
        assert!(parser.parse(b"200 OK\r\n").unwrap().is_none());
        assert!(parser.parse(b"Content-Type: text/plain\r\n").unwrap().is_none());
        assert!(parser.parse(b"Content-Length: 4\r").unwrap().is_none());
        let head = parser.parse(b"\n\r\nTest").unwrap().unwrap();

        assert_eq!(head.headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(parser.take_remaining(), b"Test");
    }

    #[test]
    fn test_response_parser_reset_for_interim() {
        let mut parser = ResponseParser::new();
        let data = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        let interim = parser.parse(data).unwrap().unwrap();
        assert_eq!(interim.status.code(), 100);

        parser.reset();
        let fin = parser.parse(b"").unwrap().unwrap();
        assert_eq!(fin.status.code(), 204);
    }

    #[test]
    fn test_request_parser() {
        let mut parser = RequestParser::new();
        let head = parser
            .parse(b"POST /submit HTTP/1.1\nHost: x\nContent-Length: 2\n\nok")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::Post);
        assert_eq!(head.target, "/submit");
        assert_eq!(head.headers.get("host"), Some("x"));
        assert_eq!(parser.take_remaining(), b"ok");
    }

    #[test]
    fn test_head_limits() {
        let mut parser = ResponseParser::new();
        let huge = vec![b'a'; MAX_HEAD_SIZE + 1];
        assert!(parser.parse(&huge).is_err());

        let mut parser = ResponseParser::new();
        assert!(parser
            .parse(b"HTTP/1.1 200 OK\r\nX: 1\r\n folded\r\n\r\n")
            .is_err());
    }

    #[test]
    fn test_find_line() {
        assert_eq!(find_line(b"Hello\r\nWorld"), Some((5, 2)));
        assert_eq!(find_line(b"NoEOL"), None);
        assert_eq!(find_line(b"\r\n"), Some((0, 2)));
        assert_eq!(find_line(b"bare\nlf"), Some((4, 1)));
    }
}
