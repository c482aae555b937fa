//! HTML → plain text for message bodies.

/// Turns a raw (usually HTML) message body into normalized plain text.
pub trait TextCleaner: Send + Sync {
    fn clean(&self, raw: &str) -> String;
}

/// Default cleaner backed by `html2text`.
#[derive(Debug, Clone, Copy)]
pub struct HtmlTextCleaner {
    width: usize,
}

impl Default for HtmlTextCleaner {
    fn default() -> Self {
        // Wide enough that paragraphs are not hard-wrapped
        Self { width: 10_000 }
    }
}

impl TextCleaner for HtmlTextCleaner {
    fn clean(&self, raw: &str) -> String {
        match html2text::from_read(raw.as_bytes(), self.width) {
            Ok(text) => normalize_whitespace(&text),
            Err(e) => {
                log::debug!("html2text failed, keeping raw body: {}", e);
                normalize_whitespace(raw)
            }
        }
    }
}

/// Trim every line and collapse runs of blank lines to one.
fn normalize_whitespace(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() && out.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}
