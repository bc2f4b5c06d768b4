//! The SMTP reply object: a three-digit code, an optional enhanced status,
//! and free-form text, per spec.md §3/§4.1/§6.

use std::fmt;

/// Enhanced status code (`class.subject.detail`), RFC 3463.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedStatus {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl EnhancedStatus {
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        EnhancedStatus {
            class,
            subject,
            detail,
        }
    }

    /// Parses `N.N.N` where the first field is the class (2, 4, or 5).
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        Some(EnhancedStatus {
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

/// Broad classification of a three-digit reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    Success,
    Intermediate,
    Transient,
    Permanent,
}

/// A complete SMTP reply: code, optional enhanced status, and one or more
/// lines of free-form text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub enhanced: Option<EnhancedStatus>,
    pub text: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Reply {
            code,
            enhanced: None,
            text: vec![text.into()],
        }
    }

    pub fn with_enhanced(code: u16, enhanced: EnhancedStatus, text: impl Into<String>) -> Self {
        Reply {
            code,
            enhanced: Some(enhanced),
            text: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Reply {
            code,
            enhanced: None,
            text: lines,
        }
    }

    /// 2xx / 3xx / 4xx / 5xx classification.
    pub fn classify(&self) -> ReplyClass {
        match self.code / 100 {
            2 => ReplyClass::Success,
            3 => ReplyClass::Intermediate,
            4 => ReplyClass::Transient,
            5 => ReplyClass::Permanent,
            _ => ReplyClass::Permanent,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.classify(), ReplyClass::Success)
    }

    /// 221 (server QUIT) or 421 (service shutting down) imply the
    /// connection closes after this reply is emitted.
    pub fn closes_connection(&self) -> bool {
        self.code == 221 || self.code == 421
    }

    /// Renders the reply as the exact bytes to put on the wire, one or more
    /// CRLF-terminated lines, continuation lines using `-`, the final line
    /// using a space, per spec.md §4.1/§6.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.text.len().saturating_sub(1);
        for (i, line) in self.text.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            match &self.enhanced {
                Some(es) => out.push_str(&format!("{}{}{} {}\r\n", self.code, sep, es, line)),
                None => out.push_str(&format!("{}{}{}\r\n", self.code, sep, line)),
            }
        }
        if self.text.is_empty() {
            match &self.enhanced {
                Some(es) => out.push_str(&format!("{} {} \r\n", self.code, es)),
                None => out.push_str(&format!("{} \r\n", self.code)),
            }
        }
        out
    }

    /// Parses a single wire line of a (possibly multi-line) reply into
    /// `(code, is_final_line, enhanced_status, text)`. Used by the client
    /// session to accumulate continuation lines.
    pub fn parse_line(line: &str) -> Option<(u16, bool, Option<EnhancedStatus>, String)> {
        if line.len() < 3 {
            return None;
        }
        let code: u16 = line.get(0..3)?.parse().ok()?;
        let (is_final, rest) = match line.as_bytes().get(3) {
            Some(b'-') => (false, line.get(4..).unwrap_or("")),
            Some(b' ') => (true, line.get(4..).unwrap_or("")),
            None => (true, ""),
            _ => return None,
        };
        // An enhanced status, if present, is the first whitespace-delimited
        // token and must share the reply code's class digit.
        let class = (code / 100) as u8;
        if let Some((maybe_status, remainder)) = rest.split_once(' ') {
            if let Some(es) = EnhancedStatus::parse(maybe_status) {
                if es.class == class {
                    return Some((code, is_final, Some(es), remainder.to_string()));
                }
            }
        } else if let Some(es) = EnhancedStatus::parse(rest) {
            if es.class == class {
                return Some((code, is_final, Some(es), String::new()));
            }
        }
        Some((code, is_final, None, rest.to_string()))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_leading_digit() {
        assert_eq!(Reply::new(250, "OK").classify(), ReplyClass::Success);
        assert_eq!(Reply::new(354, "go").classify(), ReplyClass::Intermediate);
        assert_eq!(Reply::new(450, "busy").classify(), ReplyClass::Transient);
        assert_eq!(Reply::new(550, "no").classify(), ReplyClass::Permanent);
    }

    #[test]
    fn closes_connection_only_for_221_421() {
        assert!(Reply::new(221, "bye").closes_connection());
        assert!(Reply::new(421, "shutting down").closes_connection());
        assert!(!Reply::new(250, "ok").closes_connection());
    }

    #[test]
    fn multiline_wire_format_uses_dash_then_space() {
        let r = Reply::multiline(250, vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(r.to_wire(), "250-a\r\n250-b\r\n250 c\r\n");
    }

    #[test]
    fn enhanced_status_round_trips() {
        let r = Reply::with_enhanced(550, EnhancedStatus::new(5, 1, 1), "no such user");
        assert_eq!(r.to_wire(), "550 5.1.1 no such user\r\n");
        let (code, is_final, es, text) = Reply::parse_line("550 5.1.1 no such user").unwrap();
        assert_eq!(code, 550);
        assert!(is_final);
        assert_eq!(es, Some(EnhancedStatus::new(5, 1, 1)));
        assert_eq!(text, "no such user");
    }

    #[test]
    fn continuation_line_parses_as_not_final() {
        let (code, is_final, _, text) = Reply::parse_line("250-PIPELINING").unwrap();
        assert_eq!(code, 250);
        assert!(!is_final);
        assert_eq!(text, "PIPELINING");
    }
}
