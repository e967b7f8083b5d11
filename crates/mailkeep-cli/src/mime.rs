use mailparse::ParsedMail;
use tracing::debug;

/// Display-ready bodies extracted from a raw RFC 822 message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExtractedBody {
    pub text: String,
    pub html: String,
}

impl ExtractedBody {
    /// HTML when available, else the plain text part.
    pub fn preferred(&self) -> &str {
        if self.html.is_empty() {
            &self.text
        } else {
            &self.html
        }
    }
}

/// Walks the MIME tree and pulls out the first text/plain and first
/// text/html parts, decoding transfer encodings and charsets along the
/// way. An unparseable message degrades to its raw bytes as text.
pub fn extract_body(raw_message: &[u8]) -> ExtractedBody {
    if raw_message.is_empty() {
        return ExtractedBody::default();
    }

    let parsed = match mailparse::parse_mail(raw_message) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(error = %err, "failed to parse message, serving raw bytes");
            return ExtractedBody {
                text: String::from_utf8_lossy(raw_message).into_owned(),
                html: String::new(),
            };
        }
    };

    let mut body = ExtractedBody::default();
    collect_parts(&parsed, &mut body);
    body
}

fn collect_parts(part: &ParsedMail<'_>, body: &mut ExtractedBody) {
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();

    if mimetype.starts_with("multipart/") {
        for subpart in &part.subparts {
            collect_parts(subpart, body);
        }
        return;
    }

    let Ok(content) = part.get_body() else {
        return;
    };

    if mimetype == "text/plain" && body.text.is_empty() {
        body.text = content;
    } else if mimetype == "text/html" && body.html.is_empty() {
        body.html = content;
    }
}
