//! SMTP reply parsing.

use std::fmt;

use super::error::{ClientError, Result};

/// One line of a (possibly multi-line) reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    /// `false` when the code is followed by `-`, meaning more lines follow.
    pub is_last: bool,
    pub message: String,
}

/// A complete SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

/// RFC 3463 enhanced status code, e.g. `5.1.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedStatus {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl EnhancedStatus {
    /// Reads the status from the start of a reply line such as `5.1.1 Unknown user`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let token = text.split_whitespace().next()?;
        let mut parts = token.splitn(3, '.');
        let class = parts.next()?.parse::<u8>().ok()?;
        let subject = parts.next()?.parse::<u16>().ok()?;
        let detail = parts.next()?.parse::<u16>().ok()?;

        matches!(class, 2 | 4 | 5).then_some(Self {
            class,
            subject,
            detail,
        })
    }
}

impl fmt::Display for EnhancedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All reply lines joined with a space, suitable for an error message.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx: the server wants more input (`DATA`, `AUTH LOGIN` challenges).
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_temporary_error() || self.is_permanent_error()
    }

    /// Enhanced status code carried at the start of the first line, if any.
    #[must_use]
    pub fn enhanced_status(&self) -> Option<EnhancedStatus> {
        self.lines.first().and_then(|line| EnhancedStatus::parse(line))
    }

    /// Parses a single reply line, without its line terminator.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't start with a three digit
    /// code followed by a space, a dash or nothing.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let bytes = line.as_bytes();
        if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
            return Err(ClientError::ParseError(format!(
                "Invalid status code in '{line}'"
            )));
        }

        let code = bytes[..3]
            .iter()
            .fold(0u16, |acc, digit| acc * 10 + u16::from(digit - b'0'));

        let is_last = match bytes.get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(other) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator 0x{other:02x} in '{line}'"
                )));
            }
        };

        Ok(ResponseLine {
            code,
            is_last,
            message: line.get(4..).unwrap_or_default().to_string(),
        })
    }

    /// Parses one complete reply from the front of `buffer`.
    ///
    /// Returns the reply and how many bytes it occupied, or `None` when the buffer
    /// does not yet hold the final line.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` for malformed lines or a multi-line reply
    /// whose lines disagree on the status code.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let line = Self::parse_line(std::str::from_utf8(raw)?)?;
            match code {
                None => code = Some(line.code),
                Some(expected) if expected != line.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {expected}, got {}",
                        line.code
                    )));
                }
                Some(_) => {}
            }

            lines.push(line.message);
            if line.is_last {
                return Ok(Some((Self::new(line.code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message())
    }
}

/// Extensions advertised in an `EHLO` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    keywords: Vec<String>,
}

impl Capabilities {
    /// The first line of an `EHLO` reply is the server's greeting, every later line
    /// names one extension.
    #[must_use]
    pub fn from_ehlo(response: &Response) -> Self {
        Self {
            keywords: response.lines.iter().skip(1).cloned().collect(),
        }
    }

    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.keywords.iter().any(|line| {
            line.split([' ', '='])
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case(extension))
        })
    }

    /// Mechanisms listed on `AUTH` lines, upper-cased. Both `AUTH PLAIN` and the
    /// legacy `AUTH=PLAIN` forms are understood.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        let mut mechanisms: Vec<String> = Vec::new();
        for line in &self.keywords {
            let mut words = line.split([' ', '=']);
            if !words
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case("AUTH"))
            {
                continue;
            }

            for mechanism in words.filter(|w| !w.is_empty()) {
                let mechanism = mechanism.to_ascii_uppercase();
                if !mechanisms.contains(&mechanism) {
                    mechanisms.push(mechanism);
                }
            }
        }
        mechanisms
    }
}
