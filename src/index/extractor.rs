use chrono::DateTime;
use regex::Regex;
use crate::core::types::RecordAttributes;

/// Pulls the cheap scalar attributes out of a raw record during index build.
///
/// Called once per record on the scanning thread, so it should look at the
/// header block only.
pub trait AttributeExtractor: Send + Sync {
    fn extract(&self, record: &[u8]) -> RecordAttributes;
}

impl<F> AttributeExtractor for F
where
    F: Fn(&[u8]) -> RecordAttributes + Send + Sync,
{
    fn extract(&self, record: &[u8]) -> RecordAttributes {
        self(record)
    }
}

/// Indexes locations only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAttributes;

impl AttributeExtractor for NoAttributes {
    fn extract(&self, _record: &[u8]) -> RecordAttributes {
        RecordAttributes::default()
    }
}

/// Reads mbox headers: thread id as group key, sender domain as secondary key,
/// `Date` as timestamp and `Message-ID`.
pub struct MboxHeaderExtractor {
    group_header: String,
    domain: Regex,
}

impl MboxHeaderExtractor {
    pub fn new() -> Self {
        MboxHeaderExtractor {
            group_header: "x-gm-thrid".to_string(),
            domain: Regex::new(r"@([A-Za-z0-9][A-Za-z0-9.\-]*)").expect("static regex"),
        }
    }

    /// Use another header (case-insensitive) as the group key.
    pub fn with_group_header(mut self, name: &str) -> Self {
        self.group_header = name.to_ascii_lowercase();
        self
    }

    fn sender_domain(&self, from: &str) -> Option<String> {
        let address = match (from.rfind('<'), from.rfind('>')) {
            (Some(open), Some(close)) if open < close => &from[open + 1..close],
            _ => from,
        };
        self.domain
            .captures(address)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim_end_matches('.').to_ascii_lowercase())
            .filter(|domain| !domain.is_empty())
    }
}

impl Default for MboxHeaderExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeExtractor for MboxHeaderExtractor {
    fn extract(&self, record: &[u8]) -> RecordAttributes {
        let mut attributes = RecordAttributes::default();

        for (name, value) in header_fields(record) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            if name == self.group_header {
                attributes.group_key.get_or_insert_with(|| value.to_string());
                continue;
            }
            match name.as_str() {
                "from" if attributes.secondary_key.is_none() => {
                    attributes.secondary_key = self.sender_domain(value);
                }
                "date" if attributes.timestamp.is_none() => {
                    attributes.timestamp = parse_date(value);
                }
                "message-id" if attributes.message_id.is_none() => {
                    let id = value.trim_start_matches('<').trim_end_matches('>');
                    if !id.is_empty() {
                        attributes.message_id = Some(id.to_string());
                    }
                }
                _ => {}
            }
        }

        attributes
    }
}

/// Header fields of a record as `(lowercased name, unfolded value)`.
///
/// Skips the envelope line and stops at the first blank line.
pub fn header_fields(record: &[u8]) -> Vec<(String, String)> {
    let header_end = find_blank_line(record).unwrap_or(record.len());
    let text = String::from_utf8_lossy(&record[..header_end]);

    let mut fields: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = fields.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        // The envelope line and anything else without a valid field name is skipped
        match line.split_once(':') {
            Some((name, value)) if !name.is_empty() && !name.contains(char::is_whitespace) => {
                fields.push((name.to_ascii_lowercase(), value.to_string()));
            }
            _ => {}
        }
    }
    fields
}

/// Start of the first blank line, LF or CRLF, whichever comes first.
fn find_blank_line(record: &[u8]) -> Option<usize> {
    (0..record.len()).find(|&i| {
        let rest = &record[i..];
        rest.starts_with(b"\n\n") || rest.starts_with(b"\r\n\r\n")
    })
}

fn parse_date(value: &str) -> Option<i64> {
    // Drop trailing comments such as "(UTC)" or "(PST)"
    let cleaned = match value.find('(') {
        Some(pos) => value[..pos].trim(),
        None => value,
    };
    DateTime::parse_from_rfc2822(cleaned)
        .ok()
        .map(|date| date.timestamp())
}
