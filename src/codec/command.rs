//! Parses a single SMTP command line into a structured `Command`.
//!
//! The verb is always upper-cased per spec.md §4.1 ("Commands are parsed
//! into `(verb, arg)` where verb is upper-cased"); everything else about the
//! command (addresses, ESMTP parameters) is extracted here so the session
//! state machines never touch raw strings.

use crate::error::ProtocolError;

/// One `NAME` or `NAME=VALUE` ESMTP parameter, as seen on `MAIL FROM` and
/// `RCPT TO`.
pub type Params = Vec<(String, Option<String>)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom { address: String, params: Params },
    RcptTo { address: String, params: Params },
    Data,
    Rset,
    Noop,
    Vrfy(String),
    Quit,
    StartTls,
    Auth { mechanism: String, initial_response: Option<String> },
}

fn parse_params(rest: &str) -> Params {
    rest.split_whitespace()
        .map(|tok| match tok.split_once('=') {
            Some((k, v)) => (k.to_uppercase(), Some(v.to_string())),
            None => (tok.to_uppercase(), None),
        })
        .collect()
}

/// Extracts the mailbox between `<` and `>`. Falls back to the first
/// whitespace-delimited token when brackets are absent, tolerating the
/// bracket-less form some clients send.
fn extract_address(after_colon: &str) -> Option<(String, &str)> {
    let trimmed = after_colon.trim_start();
    if let Some(start) = trimmed.find('<') {
        let end = trimmed[start..].find('>')? + start;
        if start > 0 && !trimmed[..start].trim().is_empty() {
            return None;
        }
        let addr = trimmed[start + 1..end].to_string();
        return Some((addr, trimmed[end + 1..].trim_start()));
    }
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let addr = parts.next()?.to_string();
    let rest = parts.next().unwrap_or("");
    Some((addr, rest))
}

/// Parses one already-dot-unstuffed, CRLF-stripped line as an SMTP command.
pub fn parse(line: &str) -> Result<Command, ProtocolError> {
    let line = line.trim_end();
    let (verb_raw, rest) = match line.find(char::is_whitespace) {
        Some(idx) => (&line[..idx], line[idx..].trim_start()),
        None => (line, ""),
    };
    // MAIL FROM: / RCPT TO: glue the colon onto the verb in some clients'
    // output; normalize by also checking for a colon inside the first token.
    let (verb_raw, rest) = if let Some(colon) = verb_raw.find(':') {
        (&verb_raw[..colon], &line[colon + 1..])
    } else {
        (verb_raw, rest)
    };
    let verb = verb_raw.to_uppercase();

    match verb.as_str() {
        "HELO" => {
            if rest.is_empty() {
                return Err(ProtocolError::Malformed("HELO requires a domain".into()));
            }
            Ok(Command::Helo(rest.trim().to_string()))
        }
        "EHLO" => Ok(Command::Ehlo(rest.trim().to_string())),
        "MAIL" => {
            let rest = rest.strip_prefix(':').unwrap_or(rest);
            let upper = rest.trim_start().to_uppercase();
            if !upper.starts_with("FROM") {
                return Err(ProtocolError::Malformed(line.to_string()));
            }
            let after_from = &rest.trim_start()[4..];
            let after_from = after_from.strip_prefix(':').unwrap_or(after_from);
            let (address, tail) = extract_address(after_from)
                .ok_or_else(|| ProtocolError::Malformed("MAIL FROM needs <address>".into()))?;
            Ok(Command::MailFrom {
                address,
                params: parse_params(tail),
            })
        }
        "RCPT" => {
            let rest = rest.strip_prefix(':').unwrap_or(rest);
            let upper = rest.trim_start().to_uppercase();
            if !upper.starts_with("TO") {
                return Err(ProtocolError::Malformed(line.to_string()));
            }
            let after_to = &rest.trim_start()[2..];
            let after_to = after_to.strip_prefix(':').unwrap_or(after_to);
            let (address, tail) = extract_address(after_to)
                .ok_or_else(|| ProtocolError::Malformed("RCPT TO needs <address>".into()))?;
            Ok(Command::RcptTo {
                address,
                params: parse_params(tail),
            })
        }
        "DATA" => Ok(Command::Data),
        "RSET" => Ok(Command::Rset),
        "NOOP" => Ok(Command::Noop),
        "VRFY" => Ok(Command::Vrfy(rest.trim().to_string())),
        "QUIT" => Ok(Command::Quit),
        "STARTTLS" => Ok(Command::StartTls),
        "AUTH" => {
            let mut parts = rest.trim().splitn(2, char::is_whitespace);
            let mechanism = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ProtocolError::Malformed("AUTH requires a mechanism".into()))?
                .to_uppercase();
            let initial_response = parts.next().map(|s| s.trim().to_string()).filter(|s| s != "=");
            Ok(Command::Auth {
                mechanism,
                initial_response,
            })
        }
        "" => Err(ProtocolError::Malformed(String::new())),
        other => Err(ProtocolError::Unrecognized(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mail_from_with_params() {
        let cmd = parse("MAIL FROM:<a@b.example> SIZE=1024 BODY=8BITMIME").unwrap();
        match cmd {
            Command::MailFrom { address, params } => {
                assert_eq!(address, "a@b.example");
                assert_eq!(params[0], ("SIZE".to_string(), Some("1024".to_string())));
                assert_eq!(params[1], ("BODY".to_string(), Some("8BITMIME".to_string())));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_rcpt_to_bracketless() {
        let cmd = parse("RCPT TO:a@b.example").unwrap();
        assert_eq!(
            cmd,
            Command::RcptTo {
                address: "a@b.example".into(),
                params: vec![]
            }
        );
    }

    #[test]
    fn parses_null_sender() {
        let cmd = parse("MAIL FROM:<>").unwrap();
        assert_eq!(
            cmd,
            Command::MailFrom {
                address: "".into(),
                params: vec![]
            }
        );
    }

    #[test]
    fn verb_is_uppercased_regardless_of_input_case() {
        assert_eq!(parse("quit").unwrap(), Command::Quit);
        assert_eq!(parse("QuIt").unwrap(), Command::Quit);
    }

    #[test]
    fn unknown_verb_is_unrecognized() {
        assert!(matches!(parse("BOGUS"), Err(ProtocolError::Unrecognized(_))));
    }

    #[test]
    fn auth_with_initial_response() {
        let cmd = parse("AUTH PLAIN AGJhcgBiYXo=").unwrap();
        assert_eq!(
            cmd,
            Command::Auth {
                mechanism: "PLAIN".into(),
                initial_response: Some("AGJhcgBiYXo=".into())
            }
        );
    }
}
