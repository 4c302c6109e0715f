//! Typed decoder for control-channel replies.
//!
//! Replies are CRLF-terminated lines of the form `250-key=value`,
//! `250+data`, or a final `250 OK`. All textual-format assumptions about
//! the protocol live here.

/// Bootstrap progress value that means "fully ready".
pub const BOOTSTRAP_COMPLETE: u32 = 100;

/// A decoded control-channel reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    /// Status code of the first line, when it parses as one.
    pub status: Option<u16>,
    /// Raw reply lines, CRLF stripped.
    pub lines: Vec<String>,
}

impl ControlReply {
    /// Decode a raw reply.
    pub fn parse(raw: &str) -> Self {
        let lines: Vec<String> = raw
            .split("\r\n")
            .map(|l| l.trim_end_matches('\n').to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let status = lines
            .first()
            .and_then(|l| l.get(..3))
            .and_then(|code| code.parse::<u16>().ok());

        Self { status, lines }
    }

    /// True when the first line carries a 2xx status code.
    pub fn is_ok(&self) -> bool {
        matches!(self.status, Some(code) if (200..300).contains(&code))
    }

    /// Look up a `KEY=VALUE` field anywhere in the reply.
    ///
    /// Values run to the next whitespace, or to the end of the line for
    /// double-quoted values (quotes stripped).
    pub fn field(&self, key: &str) -> Option<&str> {
        let needle = format!("{}=", key);
        for line in &self.lines {
            let mut rest = line.as_str();
            while let Some(pos) = rest.find(&needle) {
                // Guard against matching inside a longer key, e.g.
                // PROGRESS must not match SUMMARY_PROGRESS.
                let boundary = pos == 0
                    || !rest.as_bytes()[pos - 1].is_ascii_alphanumeric()
                        && rest.as_bytes()[pos - 1] != b'_';
                let after = &rest[pos + needle.len()..];
                if boundary {
                    if let Some(quoted) = after.strip_prefix('"') {
                        return Some(quoted.split('"').next().unwrap_or(quoted));
                    }
                    return Some(after.split_whitespace().next().unwrap_or(after));
                }
                rest = &rest[pos + needle.len()..];
            }
        }
        None
    }

    /// Extract the bootstrap `PROGRESS` field, when present and numeric.
    pub fn bootstrap_progress(&self) -> Option<u32> {
        self.field("PROGRESS")?.parse().ok()
    }

    /// True iff the reply reports a complete bootstrap.
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrap_progress() == Some(BOOTSTRAP_COMPLETE)
    }
}
