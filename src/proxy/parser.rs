use regex::bytes::Regex;

/// The parsed shape of an inbound CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// `host:port` the client wants tunneled.
    pub target: String,
    /// Client's User-Agent, forwarded to the upstream when present.
    pub user_agent: Option<String>,
}

/// Extracts the request line and User-Agent from a raw header block.
/// Regexes are compiled once at construction and shared by every handler.
pub struct RequestParser {
    request_line: Regex,
    user_agent: Regex,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            request_line: Regex::new(r"^CONNECT\s+(\S+)\s+HTTP/1\.1").expect("valid regex"),
            user_agent: Regex::new(r"(?i)user-agent:\s*([^\r\n]+)").expect("valid regex"),
        }
    }

    /// Returns `None` for anything that is not a CONNECT request.
    pub fn parse(&self, header_block: &[u8]) -> Option<ConnectRequest> {
        let caps = self.request_line.captures(header_block)?;
        let target = std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?.to_string();

        let user_agent = self
            .user_agent
            .captures(header_block)
            .and_then(|caps| caps.get(1))
            .and_then(|m| std::str::from_utf8(m.as_bytes()).ok())
            .map(|s| s.trim().to_string());

        Some(ConnectRequest { target, user_agent })
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}
