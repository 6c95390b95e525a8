//! Message builder producing an RFC 5322 payload with MIME bodies and attachments.

use std::{fmt::Write as _, path::Path};

use base64::{Engine, engine::general_purpose::STANDARD};

use super::error::{ClientError, Result};

/// Longest line RFC 5321 lets us put on the wire, excluding CRLF.
const MAX_LINE_LENGTH: usize = 998;

/// An email attachment with filename, content type, and data.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    /// Reads `path`, guessing the content type from its extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the path has no file name or cannot be read.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ClientError::BuilderError(format!("Invalid filename: {}", path.display())))?
            .to_string();

        let data = tokio::fs::read(path).await.map_err(|e| {
            ClientError::BuilderError(format!("Failed to read file {}: {e}", path.display()))
        })?;

        Ok(Self {
            filename,
            content_type: guess_content_type(path),
            data,
        })
    }
}

/// Builder for transport-ready messages.
///
/// Produces `Date`, `Message-ID` and `MIME-Version` headers unless given explicitly,
/// encodes non-ASCII header text (RFC 2047), and picks the MIME layout from what was
/// supplied: a single part, `multipart/alternative` for text plus HTML, wrapped in
/// `multipart/mixed` when there are attachments.
///
/// ```
/// use courier_smtp::client::MessageBuilder;
///
/// let message = MessageBuilder::new()
///     .from("sender@example.com")
///     .to("recipient@example.com")
///     .subject("Hello")
///     .text("This is the message body")
///     .build()
///     .unwrap();
/// assert!(message.starts_with(b"From: sender@example.com\r\n"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<String>,
    to: Vec<String>,
    cc: Vec<String>,
    reply_to: Option<String>,
    subject: Option<String>,
    headers: Vec<(String, String)>,
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<Attachment>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from(mut self, mailbox: impl Into<String>) -> Self {
        self.from = Some(mailbox.into());
        self
    }

    #[must_use]
    pub fn to(mut self, mailbox: impl Into<String>) -> Self {
        self.to.push(mailbox.into());
        self
    }

    #[must_use]
    pub fn cc(mut self, mailbox: impl Into<String>) -> Self {
        self.cc.push(mailbox.into());
        self
    }

    #[must_use]
    pub fn reply_to(mut self, mailbox: impl Into<String>) -> Self {
        self.reply_to = Some(mailbox.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Adds a header verbatim. A `Message-ID` or `Date` given here replaces the
    /// generated one.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Plain text body.
    #[must_use]
    pub fn text(mut self, content: impl Into<String>) -> Self {
        self.text = Some(content.into());
        self
    }

    /// HTML body; sent as an alternative when a text body is present too.
    #[must_use]
    pub fn html(mut self, content: impl Into<String>) -> Self {
        self.html = Some(content.into());
        self
    }

    #[must_use]
    pub fn attach(
        mut self,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.attachments.push(Attachment {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        });
        self
    }

    /// Adds an attachment read from disk. See [`Attachment::from_file`].
    ///
    /// # Errors
    ///
    /// Returns an error if the path has no file name or cannot be read.
    pub async fn attach_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.attachments.push(Attachment::from_file(path).await?);
        Ok(self)
    }

    /// A bare CR or LF in header text would end the header early and start a new one.
    fn check_line_breaks(&self) -> Result<()> {
        let single = [
            ("From", self.from.as_deref()),
            ("Reply-To", self.reply_to.as_deref()),
            ("Subject", self.subject.as_deref()),
        ];
        let fields = single
            .into_iter()
            .filter_map(|(name, value)| value.map(|value| (name, value)))
            .chain(self.to.iter().map(|value| ("To", value.as_str())))
            .chain(self.cc.iter().map(|value| ("Cc", value.as_str())))
            .chain(self.headers.iter().flat_map(|(name, value)| {
                [("header name", name.as_str()), (name.as_str(), value.as_str())]
            }))
            .chain(self.attachments.iter().flat_map(|attachment| {
                [
                    ("attachment filename", attachment.filename.as_str()),
                    ("attachment content type", attachment.content_type.as_str()),
                ]
            }));

        for (field, value) in fields {
            if value.contains(['\r', '\n']) {
                return Err(ClientError::BuilderError(format!(
                    "{field} contains a line break"
                )));
            }
        }
        Ok(())
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Assembles the message.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::BuilderError`] when there is no `From` mailbox, or when
    /// a header value, attachment filename or content type contains CR or LF.
    pub fn build(self) -> Result<Vec<u8>> {
        let from = self
            .from
            .as_deref()
            .ok_or_else(|| ClientError::BuilderError("Missing From mailbox".to_string()))?;
        self.check_line_breaks()?;

        let mut out = String::with_capacity(1024);
        push_header(&mut out, "From", from);

        if self.to.is_empty() && self.cc.is_empty() {
            push_header(&mut out, "To", "undisclosed-recipients:;");
        } else if !self.to.is_empty() {
            push_header(&mut out, "To", &self.to.join(", "));
        }
        if !self.cc.is_empty() {
            push_header(&mut out, "Cc", &self.cc.join(", "));
        }
        if let Some(reply_to) = &self.reply_to {
            push_header(&mut out, "Reply-To", reply_to);
        }
        if let Some(subject) = &self.subject {
            push_header(&mut out, "Subject", &encode_word(subject));
        }
        if !self.has_header("Date") {
            push_header(&mut out, "Date", &chrono::Utc::now().to_rfc2822());
        }
        if !self.has_header("Message-ID") {
            let domain = from
                .rsplit_once('@')
                .map_or("localhost", |(_, domain)| domain.trim_end_matches('>'));
            push_header(&mut out, "Message-ID", &format!("<{}@{domain}>", ulid::Ulid::new()));
        }
        for (name, value) in &self.headers {
            push_header(&mut out, name, value);
        }
        push_header(&mut out, "MIME-Version", "1.0");

        let body = match (&self.text, &self.html) {
            (Some(text), Some(html)) => Part::Alternative(vec![
                Part::Text("plain", text),
                Part::Text("html", html),
            ]),
            (None, Some(html)) => Part::Text("html", html),
            (text, None) => Part::Text("plain", text.as_deref().unwrap_or_default()),
        };

        if self.attachments.is_empty() {
            body.write(&mut out);
        } else {
            let mut parts = vec![body];
            parts.extend(self.attachments.iter().map(Part::Attachment));
            Part::Mixed(parts).write(&mut out);
        }

        Ok(out.into_bytes())
    }
}

enum Part<'a> {
    Text(&'static str, &'a str),
    Attachment(&'a Attachment),
    Alternative(Vec<Part<'a>>),
    Mixed(Vec<Part<'a>>),
}

impl Part<'_> {
    /// Writes the part's headers, a blank line and its content.
    fn write(&self, out: &mut String) {
        match self {
            Self::Text(subtype, content) => {
                push_header(out, "Content-Type", &format!("text/{subtype}; charset=utf-8"));
                if needs_base64(content) {
                    push_header(out, "Content-Transfer-Encoding", "base64");
                    out.push_str("\r\n");
                    push_base64(out, content.as_bytes());
                } else {
                    push_header(out, "Content-Transfer-Encoding", "7bit");
                    out.push_str("\r\n");
                    out.push_str(content);
                    if !content.ends_with('\n') {
                        out.push_str("\r\n");
                    }
                }
            }
            Self::Attachment(attachment) => {
                push_header(out, "Content-Type", &attachment.content_type);
                push_header(out, "Content-Transfer-Encoding", "base64");
                push_header(
                    out,
                    "Content-Disposition",
                    &format!(
                        "attachment; filename=\"{}\"",
                        encode_word(&attachment.filename).replace('"', "")
                    ),
                );
                out.push_str("\r\n");
                push_base64(out, &attachment.data);
            }
            Self::Alternative(parts) => write_multipart(out, "alternative", parts),
            Self::Mixed(parts) => write_multipart(out, "mixed", parts),
        }
    }
}

fn write_multipart(out: &mut String, subtype: &str, parts: &[Part<'_>]) {
    let boundary = format!("=_courier_{}", ulid::Ulid::new());
    push_header(
        out,
        "Content-Type",
        &format!("multipart/{subtype}; boundary=\"{boundary}\""),
    );
    out.push_str("\r\n");

    for part in parts {
        let _ = write!(out, "--{boundary}\r\n");
        part.write(out);
    }
    let _ = write!(out, "--{boundary}--\r\n");
}

fn push_header(out: &mut String, name: &str, value: &str) {
    let _ = write!(out, "{name}: {value}\r\n");
}

fn needs_base64(content: &str) -> bool {
    !content.is_ascii() || content.lines().any(|line| line.len() > MAX_LINE_LENGTH)
}

/// Base64 with 76 character lines, as MIME requires.
fn push_base64(out: &mut String, data: &[u8]) {
    let encoded = STANDARD.encode(data);
    for chunk in encoded.as_bytes().chunks(76) {
        // base64 output is ASCII, so every chunk is valid UTF-8
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push_str("\r\n");
    }
}

/// RFC 2047 encoded-word for header text that is not plain ASCII.
fn encode_word(text: &str) -> String {
    if text.is_ascii() {
        text.to_string()
    } else {
        format!("=?utf-8?B?{}?=", STANDARD.encode(text))
    }
}

fn guess_content_type(path: &Path) -> String {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    match extension.to_ascii_lowercase().as_str() {
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "zip" => "application/zip",
        "json" => "application/json",
        "xml" => "application/xml",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use mailparse::MailHeaderMap;
    use pretty_assertions::assert_eq;

    use super::*;

    fn parsed(message: &[u8]) -> mailparse::ParsedMail<'_> {
        mailparse::parse_mail(message).expect("builder output should parse")
    }

    #[test]
    fn test_simple_message() {
        let message = MessageBuilder::new()
            .from("sender@example.com")
            .to("recipient@example.com")
            .subject("Test")
            .text("Hello World")
            .build()
            .unwrap();

        let mail = parsed(&message);
        let headers = &mail.headers;
        assert_eq!(headers.get_first_value("From").as_deref(), Some("sender@example.com"));
        assert_eq!(headers.get_first_value("To").as_deref(), Some("recipient@example.com"));
        assert_eq!(headers.get_first_value("Subject").as_deref(), Some("Test"));
        assert!(headers.get_first_value("Date").is_some());
        assert!(
            headers
                .get_first_value("Message-ID")
                .is_some_and(|id| id.ends_with("@example.com>"))
        );
        assert_eq!(mail.ctype.mimetype, "text/plain");
        assert_eq!(mail.get_body().unwrap().trim_end(), "Hello World");
    }

    #[test]
    fn test_explicit_message_id_is_kept() {
        let message = MessageBuilder::new()
            .from("sender@example.com")
            .to("recipient@example.com")
            .header("Message-ID", "<fixed@example.com>")
            .text("Body")
            .build()
            .unwrap();

        let text = String::from_utf8(message).unwrap();
        assert_eq!(text.matches("Message-ID:").count(), 1);
        assert!(text.contains("Message-ID: <fixed@example.com>"));
    }

    #[test]
    fn test_missing_from() {
        let err = MessageBuilder::new().to("a@example.com").build().unwrap_err();
        assert!(matches!(err, ClientError::BuilderError(_)));
    }

    #[test]
    fn test_text_and_html_alternative() {
        let message = MessageBuilder::new()
            .from("sender@example.com")
            .to("recipient@example.com")
            .text("plain version")
            .html("<p>html version</p>")
            .build()
            .unwrap();

        let mail = parsed(&message);
        assert_eq!(mail.ctype.mimetype, "multipart/alternative");
        assert_eq!(mail.subparts.len(), 2);
        assert_eq!(mail.subparts[1].ctype.mimetype, "text/html");
    }

    #[test]
    fn test_attachment_round_trips() {
        let message = MessageBuilder::new()
            .from("sender@example.com")
            .to("recipient@example.com")
            .text("See attachment")
            .attach("report.csv", "text/csv", b"a,b\n1,2\n".to_vec())
            .build()
            .unwrap();

        let mail = parsed(&message);
        assert_eq!(mail.ctype.mimetype, "multipart/mixed");
        assert_eq!(mail.subparts.len(), 2);
        assert_eq!(mail.subparts[1].get_body_raw().unwrap(), b"a,b\n1,2\n");
    }

    #[test]
    fn test_unicode_subject_and_body() {
        let message = MessageBuilder::new()
            .from("sender@example.com")
            .to("recipient@example.com")
            .subject("Grüße")
            .text("Schöne Grüße")
            .build()
            .unwrap();

        assert!(message.is_ascii());
        let mail = parsed(&message);
        assert_eq!(mail.headers.get_first_value("Subject").as_deref(), Some("Grüße"));
        assert_eq!(mail.get_body().unwrap(), "Schöne Grüße");
    }

    #[test]
    fn test_bcc_only_uses_undisclosed() {
        let message = MessageBuilder::new()
            .from("sender@example.com")
            .text("hi")
            .build()
            .unwrap();
        assert!(String::from_utf8(message).unwrap().contains("To: undisclosed-recipients:;\r\n"));
    }

    #[test]
    fn test_line_break_in_subject_rejected() {
        let err = MessageBuilder::new()
            .from("sender@example.com")
            .to("recipient@example.com")
            .subject("Hello\r\nBcc: intruder@example.net")
            .text("hi")
            .build()
            .unwrap_err();

        assert!(matches!(err, ClientError::BuilderError(ref reason) if reason.contains("Subject")));
    }

    #[test]
    fn test_line_break_in_attachment_filename_rejected() {
        let err = MessageBuilder::new()
            .from("sender@example.com")
            .to("recipient@example.com")
            .text("See attachment")
            .attach("report.csv\nX-Injected: yes", "text/csv", b"a,b\n".to_vec())
            .build()
            .unwrap_err();

        assert!(
            matches!(err, ClientError::BuilderError(ref reason) if reason.contains("attachment filename"))
        );
    }

    #[test]
    fn test_line_break_in_custom_header_rejected() {
        let result = MessageBuilder::new()
            .from("sender@example.com")
            .to("recipient@example.com")
            .header("X-Tag", "one\rtwo")
            .text("hi")
            .build();

        assert!(matches!(result, Err(ClientError::BuilderError(_))));
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type(Path::new("a/b/report.PDF")), "application/pdf");
        assert_eq!(guess_content_type(Path::new("notes")), "application/octet-stream");
    }
}
