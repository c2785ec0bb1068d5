//! Minimal `---` frontmatter for packet and directive files.
//!
//! Only flat `key: value` lines are supported. Bodies are stored trimmed and
//! rendered with a single trailing newline, so parse(render(x)) == x.

/// A parsed frontmatter document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub fields: Vec<(String, String)>,
    pub body: String,
}

impl Document {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Render fields and body. Values must not contain newlines.
pub fn render(fields: &[(&str, String)], body: &str) -> String {
    let mut buf = String::from("---\n");
    for (key, value) in fields {
        buf.push_str(key);
        buf.push_str(": ");
        buf.push_str(value);
        buf.push('\n');
    }
    buf.push_str("---\n\n");
    buf.push_str(body.trim());
    buf.push('\n');
    buf
}

/// Parse a document. Returns `None` when there is no frontmatter block.
pub fn parse(contents: &str) -> Option<Document> {
    let rest = contents.strip_prefix("---\n")?;
    let end = rest.find("\n---\n").map(|idx| (idx, idx + 5)).or_else(|| {
        // Empty frontmatter: the closing fence follows the opening one.
        rest.strip_prefix("---\n").map(|_| (0, 4))
    })?;
    let (header, body) = (&rest[..end.0], &rest[end.1..]);

    let mut fields = Vec::new();
    for line in header.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (key, value) = trimmed.split_once(':')?;
        fields.push((key.trim().to_string(), value.trim().to_string()));
    }

    Some(Document {
        fields,
        body: body.trim().to_string(),
    })
}
