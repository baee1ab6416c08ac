//! Wire-format SMTP replies: a status code, an optional enhanced code, and
//! one or more lines of text, rendered with `250-`/`250 ` continuation
//! markers per RFC 5321 §4.2.1.

use std::borrow::Cow;
use std::fmt::{self, Display, Write as _};

use crate::error::EnhancedCode;

#[derive(Debug, Clone)]
pub struct Reply {
    code: u16,
    enhanced: Option<EnhancedCode>,
    lines: Vec<Cow<'static, str>>,
}

impl Reply {
    /// Builds a reply, synthesising an enhanced code from the status
    /// class (`2xx/4xx/5xx -> n.0.0`) when none is given.
    pub fn new(code: u16, enhanced: Option<EnhancedCode>, text: impl Into<Cow<'static, str>>) -> Self {
        Reply {
            code,
            enhanced: enhanced.or_else(|| Self::synthesize(code)),
            lines: vec![text.into()],
        }
    }

    /// A reply with no enhanced code at all (used for 220/334 lines, which
    /// traditionally carry none).
    pub fn bare(code: u16, text: impl Into<Cow<'static, str>>) -> Self {
        Reply {
            code,
            enhanced: None,
            lines: vec![text.into()],
        }
    }

    /// A multi-line reply, e.g. the EHLO capability list.
    pub fn multiline(code: u16, enhanced: Option<EnhancedCode>, lines: Vec<String>) -> Self {
        Reply {
            code,
            enhanced,
            lines: lines.into_iter().map(Cow::Owned).collect(),
        }
    }

    fn synthesize(code: u16) -> Option<EnhancedCode> {
        match code / 100 {
            2 | 4 | 5 => Some(EnhancedCode((code / 100) as u16, 0, 0)),
            _ => None,
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn ok() -> Self {
        Self::new(250, None, "OK")
    }

    pub fn bad_sequence() -> Self {
        Self::new(503, Some(EnhancedCode(5, 5, 1)), "Bad sequence of commands")
    }

    pub fn not_implemented() -> Self {
        Self::new(502, Some(EnhancedCode(5, 5, 1)), "Command not implemented")
    }

    /// Serializes into the CRLF-terminated wire form.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len() - 1;
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            match &self.enhanced {
                Some(ec) => write!(out, "{}{}{} {}\r\n", self.code, sep, ec, line).unwrap(),
                None => write!(out, "{}{}{}\r\n", self.code, sep, line).unwrap(),
            }
        }
        out
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl From<crate::error::SmtpError> for Reply {
    fn from(e: crate::error::SmtpError) -> Self {
        Reply::new(e.code, Some(e.enhanced), e.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_reply_uses_space_separator() {
        let r = Reply::new(250, None, "OK: queued");
        assert_eq!(r.to_wire(), "250 2.0.0 OK: queued\r\n");
    }

    #[test]
    fn multiline_reply_uses_dash_on_all_but_last() {
        let r = Reply::multiline(
            250,
            None,
            vec!["Hello there".to_string(), "PIPELINING".to_string(), "SIZE".to_string()],
        );
        let wire = r.to_wire();
        let mut lines = wire.lines();
        assert_eq!(lines.next().unwrap(), "250-Hello there\r");
        assert_eq!(lines.next().unwrap(), "250-PIPELINING\r");
        assert_eq!(lines.next().unwrap(), "250 SIZE\r");
    }

    #[test]
    fn bare_reply_has_no_enhanced_code() {
        let r = Reply::bare(220, "mx.example ESMTP ready");
        assert_eq!(r.to_wire(), "220 mx.example ESMTP ready\r\n");
    }

    #[test]
    fn enhanced_code_synthesized_from_class() {
        let r = Reply::new(451, None, "backend unavailable");
        assert_eq!(r.to_wire(), "451 4.0.0 backend unavailable\r\n");
    }
}
