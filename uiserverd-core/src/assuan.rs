//! Line codec for the Assuan protocol.
//!
//! Both halves of the daemon speak Assuan: the server side accepts
//! commands from mail clients and file managers, the client side talks
//! to gpg-agent for card events. This module owns the wire format and
//! nothing else; sockets and dispatch live in `server`.
//!
//! Arguments containing whitespace must be percent-escaped by the peer.

use std::collections::HashMap;

use thiserror::Error;

use crate::error::wire_code;

/// Hard line length limit from the Assuan specification.
pub const MAX_LINE_LEN: usize = 1000;

/// Payload capacity of a single data line ("D ", escaping overhead aside).
const DATA_CHUNK: usize = MAX_LINE_LEN - 2;

#[derive(Debug, Error)]
pub enum AssuanError {
    #[error("assuan: empty line")]
    EmptyLine,

    #[error("assuan: line exceeds {MAX_LINE_LEN} bytes")]
    LineTooLong,

    #[error("assuan: malformed percent escape")]
    BadEscape,

    #[error("assuan: malformed server line: {0}")]
    MalformedServerLine(String),
}

pub type Result<T> = std::result::Result<T, AssuanError>;

// ============================================================================
// Escaping
// ============================================================================

/// Escape the bytes libassuan refuses to pass verbatim: '%', CR and LF.
pub fn percent_escape(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'%' => out.push_str("%25"),
            b'\r' => out.push_str("%0D"),
            b'\n' => out.push_str("%0A"),
            _ => out.push(b as char),
        }
    }
    out
}

/// Decode any %XX escape, not just the ones we emit ourselves.
pub fn percent_unescape(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).copied().ok_or(AssuanError::BadEscape)?;
            let lo = bytes.get(i + 2).copied().ok_or(AssuanError::BadEscape)?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).map_err(|_| AssuanError::BadEscape)?;
            let val = u8::from_str_radix(hex, 16).map_err(|_| AssuanError::BadEscape)?;
            out.push(val);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn unescape_to_string(text: &str) -> Result<String> {
    let bytes = percent_unescape(text)?;
    String::from_utf8(bytes).map_err(|_| AssuanError::BadEscape)
}

// ============================================================================
// Requests (client -> server)
// ============================================================================

/// A parsed command line as received from a client.
#[derive(Debug, Clone)]
pub struct Request {
    /// Command name, uppercased.
    pub name: String,
    /// Everything after the name, undecoded.
    pub rest: String,
    options: HashMap<String, Option<String>>,
    positional: Vec<String>,
}

impl Request {
    /// Parse one request line. Tokens are whitespace separated; a
    /// leading `--` marks an option, `KEY=VALUE` pairs and bare words
    /// stay positional. Option values and positionals are unescaped.
    pub fn parse(line: &str) -> Result<Request> {
        if line.len() > MAX_LINE_LEN {
            return Err(AssuanError::LineTooLong);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(AssuanError::EmptyLine);
        }

        let mut tokens = trimmed.split_ascii_whitespace();
        let name = tokens
            .next()
            .ok_or(AssuanError::EmptyLine)?
            .to_ascii_uppercase();
        let rest = trimmed[name.len().min(trimmed.len())..]
            .trim_start()
            .to_owned();

        let mut options = HashMap::new();
        let mut positional = Vec::new();
        let mut no_more_options = false;
        for tok in tokens {
            if !no_more_options && tok == "--" {
                no_more_options = true;
                continue;
            }
            if !no_more_options && tok.starts_with("--") {
                let body = &tok[2..];
                match body.split_once('=') {
                    Some((key, value)) => {
                        options.insert(key.to_ascii_lowercase(), Some(unescape_to_string(value)?));
                    }
                    None => {
                        options.insert(body.to_ascii_lowercase(), None);
                    }
                }
            } else {
                positional.push(unescape_to_string(tok)?);
            }
        }

        Ok(Request {
            name,
            rest,
            options,
            positional,
        })
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    /// The option's value, if one was given with `--name=value`.
    pub fn option_value(&self, name: &str) -> Option<&str> {
        self.options.get(name).and_then(|v| v.as_deref())
    }

    pub fn positional(&self) -> &[String] {
        &self.positional
    }

    /// Positional tokens joined back into one string (for ECHO and friends).
    pub fn positional_joined(&self) -> String {
        self.positional.join(" ")
    }
}

/// Split an Assuan `KEY=VALUE` argument token.
pub fn split_keyval(token: &str) -> Option<(&str, &str)> {
    token.split_once('=')
}

// ============================================================================
// Responses (server -> client)
// ============================================================================

pub fn ok_line(note: Option<&str>) -> String {
    match note {
        Some(note) => format!("OK {note}"),
        None => "OK".to_owned(),
    }
}

pub fn err_line(code: u32, description: &str) -> String {
    format!(
        "ERR {} {}",
        wire_code(code),
        percent_escape(description.as_bytes())
    )
}

pub fn status_line(keyword: &str, payload: &str) -> String {
    if payload.is_empty() {
        format!("S {keyword}")
    } else {
        format!("S {keyword} {}", percent_escape(payload.as_bytes()))
    }
}

pub fn inquire_line(keyword: &str) -> String {
    format!("INQUIRE {keyword}")
}

pub fn comment_line(text: &str) -> String {
    format!("# {}", percent_escape(text.as_bytes()))
}

/// Render a payload as data lines, keeping escape sequences intact
/// across chunk boundaries.
pub fn data_lines(data: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::from("D ");
    for &b in data {
        let piece = match b {
            b'%' => "%25".to_owned(),
            b'\r' => "%0D".to_owned(),
            b'\n' => "%0A".to_owned(),
            _ => (b as char).to_string(),
        };
        if current.len() + piece.len() > DATA_CHUNK {
            lines.push(current);
            current = String::from("D ");
        }
        current.push_str(&piece);
    }
    if current.len() > 2 || lines.is_empty() {
        lines.push(current);
    }
    lines
}

// ============================================================================
// Server lines (parsed on the client side)
// ============================================================================

/// One response line as seen by an Assuan client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    Ok(String),
    Err { code: u32, description: String },
    Status { keyword: String, payload: String },
    Data(Vec<u8>),
    Inquire(String),
    Comment(String),
}

/// Parse a line sent by an Assuan server.
pub fn parse_server_line(line: &str) -> Result<ServerLine> {
    if line.len() > MAX_LINE_LEN {
        return Err(AssuanError::LineTooLong);
    }
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(AssuanError::EmptyLine);
    }

    if let Some(rest) = line.strip_prefix("OK") {
        return Ok(ServerLine::Ok(rest.trim_start().to_owned()));
    }
    if let Some(rest) = line.strip_prefix("ERR ") {
        let mut parts = rest.splitn(2, ' ');
        let code = parts
            .next()
            .and_then(|c| c.parse::<u32>().ok())
            .ok_or_else(|| AssuanError::MalformedServerLine(line.to_owned()))?;
        let description = parts.next().unwrap_or("").to_owned();
        return Ok(ServerLine::Err { code, description });
    }
    if let Some(rest) = line.strip_prefix("S ") {
        let mut parts = rest.splitn(2, ' ');
        let keyword = parts
            .next()
            .ok_or_else(|| AssuanError::MalformedServerLine(line.to_owned()))?
            .to_owned();
        let payload = match parts.next() {
            Some(p) => unescape_to_string(p)?,
            None => String::new(),
        };
        return Ok(ServerLine::Status { keyword, payload });
    }
    if let Some(rest) = line.strip_prefix("D ") {
        return Ok(ServerLine::Data(percent_unescape(rest)?));
    }
    if let Some(rest) = line.strip_prefix("INQUIRE ") {
        return Ok(ServerLine::Inquire(rest.trim().to_owned()));
    }
    if let Some(rest) = line.strip_prefix("# ") {
        return Ok(ServerLine::Comment(rest.to_owned()));
    }
    if line == "#" {
        return Ok(ServerLine::Comment(String::new()));
    }
    Err(AssuanError::MalformedServerLine(line.to_owned()))
}

/// Client reply lines while an INQUIRE is outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InquireReply {
    Data(Vec<u8>),
    End,
    Can,
}

pub fn parse_inquire_reply(line: &str) -> Result<InquireReply> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(rest) = line.strip_prefix("D ") {
        return Ok(InquireReply::Data(percent_unescape(rest)?));
    }
    match line {
        "END" => Ok(InquireReply::End),
        "CAN" => Ok(InquireReply::Can),
        _ => Err(AssuanError::MalformedServerLine(line.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    #[test]
    fn escape_round_trip() {
        let raw = b"100% pure\r\nline";
        let escaped = percent_escape(raw);
        assert!(!escaped.contains('\n'));
        assert_eq!(percent_unescape(&escaped).unwrap(), raw.to_vec());
    }

    #[test]
    fn parse_request_with_options() {
        let req = Request::parse("ENCRYPT --protocol=OpenPGP --expect-sign data").unwrap();
        assert_eq!(req.name, "ENCRYPT");
        assert!(req.has_option("protocol"));
        assert_eq!(req.option_value("protocol"), Some("OpenPGP"));
        assert!(req.has_option("expect-sign"));
        assert_eq!(req.option_value("expect-sign"), None);
        assert_eq!(req.positional(), ["data"]);
    }

    #[test]
    fn parse_request_uppercases_name() {
        let req = Request::parse("input FILE=/tmp/a%20b.txt").unwrap();
        assert_eq!(req.name, "INPUT");
        assert_eq!(req.positional(), ["FILE=/tmp/a b.txt"]);
    }

    #[test]
    fn double_dash_ends_option_parsing() {
        let req = Request::parse("ECHO -- --not-an-option").unwrap();
        assert!(!req.has_option("not-an-option"));
        assert_eq!(req.positional(), ["--not-an-option"]);
    }

    #[test]
    fn err_line_carries_composed_code() {
        let line = err_line(codes::CANCELED, "User canceled");
        assert_eq!(line, format!("ERR {} User canceled", 536_870_912 + 99));
        match parse_server_line(&line).unwrap() {
            ServerLine::Err { code, description } => {
                assert_eq!(crate::error::bare_code(code), codes::CANCELED);
                assert_eq!(description, "User canceled");
            }
            other => panic!("unexpected line: {other:?}"),
        }
    }

    #[test]
    fn data_lines_chunk_without_splitting_escapes() {
        let mut payload = vec![b'x'; DATA_CHUNK - 3];
        payload.push(b'%');
        payload.extend_from_slice(b"tail");
        let lines = data_lines(&payload);
        assert!(lines.len() >= 2);
        let mut decoded = Vec::new();
        for line in &lines {
            assert!(line.len() <= MAX_LINE_LEN);
            let ServerLine::Data(chunk) = parse_server_line(line).unwrap() else {
                panic!("expected data line");
            };
            decoded.extend_from_slice(&chunk);
        }
        assert_eq!(decoded, payload);
    }

    #[test]
    fn inquire_replies() {
        assert_eq!(parse_inquire_reply("END").unwrap(), InquireReply::End);
        assert_eq!(parse_inquire_reply("CAN").unwrap(), InquireReply::Can);
        assert_eq!(
            parse_inquire_reply("D fingerprint").unwrap(),
            InquireReply::Data(b"fingerprint".to_vec())
        );
    }

    #[test]
    fn overlong_line_is_rejected() {
        let line = format!("ECHO {}", "a".repeat(MAX_LINE_LEN));
        assert!(matches!(
            Request::parse(&line),
            Err(AssuanError::LineTooLong)
        ));
    }
}
