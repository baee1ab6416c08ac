//! Command-line parsing: splits a received line into a verb and argument
//! by fixed offset (a command verb is always four characters), rather than
//! a general grammar.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: String,
    pub arg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("command too short: {0:?}")]
    TooShort(String),
    #[error("mangled command: {0:?}")]
    Mangled(String),
}

/// Splits one received line (CRLF already stripped) into a verb and an
/// argument string. Returns `Ok(None)` for an empty line, which the caller
/// should silently ignore.
pub fn parse_cmd(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);

    if line.to_ascii_uppercase().starts_with("STARTTLS") {
        return Ok(Some(Command {
            verb: "STARTTLS".to_string(),
            arg: String::new(),
        }));
    }

    let len = line.len();
    if len == 0 {
        return Ok(None);
    }
    if len < 4 {
        return Err(ParseError::TooShort(line.to_string()));
    }
    if len == 4 {
        return Ok(Some(Command {
            verb: line.to_ascii_uppercase(),
            arg: String::new(),
        }));
    }
    if len == 5 {
        // Too long to be a bare 4-char verb, too short to have a separator
        // and an argument.
        return Err(ParseError::Mangled(line.to_string()));
    }

    let bytes = line.as_bytes();
    if bytes[4] != b' ' {
        return Err(ParseError::Mangled(line.to_string()));
    }

    Ok(Some(Command {
        verb: line[0..4].to_ascii_uppercase(),
        arg: line[5..].trim_matches([' ', '\r', '\n']).to_string(),
    }))
}

/// Parses `KEY=VALUE` / `KEY` tokens, space-separated, as used by MAIL FROM
/// and RCPT TO parameter lists. Duplicate keys overwrite; a key without `=`
/// maps to an empty value.
pub fn parse_args(args: &[&str]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for arg in args {
        if arg.is_empty() {
            continue;
        }
        match arg.split_once('=') {
            Some((k, v)) => {
                map.insert(k.to_ascii_uppercase(), v.to_string());
            }
            None => {
                map.insert(arg.to_ascii_uppercase(), String::new());
            }
        }
    }
    map
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("domain argument required")]
pub struct HelloArgError;

/// Extracts the domain/address literal from a HELO/EHLO/LHLO argument,
/// ignoring anything after the first space.
pub fn parse_hello_argument(arg: &str) -> Result<String, HelloArgError> {
    let domain = arg.split(' ').next().unwrap_or("");
    if domain.is_empty() {
        return Err(HelloArgError);
    }
    Ok(domain.to_string())
}

/// RFC 4954 §8 xtext decoding: a `+` must be followed by exactly two hex
/// digits, otherwise decoding fails rather than passing the escape through
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid xtext escape")]
pub struct XtextError;

pub fn decode_xtext(val: &str) -> Result<String, XtextError> {
    if !val.contains('+') {
        return Ok(val.to_string());
    }

    let chars: Vec<char> = val.chars().collect();
    let mut out = String::with_capacity(val.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '+' {
            let hex: String = chars.get(i + 1..i + 3).ok_or(XtextError)?.iter().collect();
            if hex.len() != 2 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(XtextError);
            }
            let byte = u8::from_str_radix(&hex, 16).map_err(|_| XtextError)?;
            out.push(byte as char);
            i += 3;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// RFC 4954 §8 xtext encoding: printable non-space US-ASCII except `+`/`=`
/// pass through, everything else becomes `+HH`.
pub fn encode_xtext(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '+' || ch == '=' {
            out.push('+');
            out.push_str(&format!("{:02X}", ch as u32));
        } else if ch > '!' && ch < '~' {
            out.push(ch);
        } else {
            out.push('+');
            out.push_str(&format!("{:02X}", ch as u32));
        }
    }
    out
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.arg.is_empty() {
            write!(f, "{}", self.verb)
        } else {
            write!(f, "{} {}", self.verb, self.arg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_is_ignored() {
        assert_eq!(parse_cmd("").unwrap(), None);
    }

    #[test]
    fn starttls_matches_regardless_of_length() {
        let cmd = parse_cmd("starttls").unwrap().unwrap();
        assert_eq!(cmd.verb, "STARTTLS");
        assert_eq!(cmd.arg, "");
    }

    #[test]
    fn four_char_verb_has_no_arg() {
        let cmd = parse_cmd("noop").unwrap().unwrap();
        assert_eq!(cmd.verb, "NOOP");
        assert_eq!(cmd.arg, "");
    }

    #[test]
    fn five_char_line_is_mangled() {
        // Not STARTTLS-prefixed, not a 4-char verb, not long enough to have
        // a separator byte at index 4 plus an argument.
        assert_eq!(
            parse_cmd("abcde"),
            Err(ParseError::Mangled("abcde".to_string()))
        );
    }

    #[test]
    fn too_short_is_an_error() {
        assert_eq!(parse_cmd("ab"), Err(ParseError::TooShort("ab".to_string())));
    }

    #[test]
    fn verb_and_arg_split_on_space_at_index_four() {
        let cmd = parse_cmd("MAIL FROM:<a@b.com>").unwrap().unwrap();
        assert_eq!(cmd.verb, "MAIL");
        assert_eq!(cmd.arg, "FROM:<a@b.com>");
    }

    #[test]
    fn missing_separator_space_is_mangled() {
        assert_eq!(
            parse_cmd("MAILxFROM:<a@b.com>"),
            Err(ParseError::Mangled("MAILxFROM:<a@b.com>".to_string()))
        );
    }

    #[test]
    fn parse_args_overwrites_duplicates_and_handles_bare_keys() {
        let args = parse_args(&["SIZE=100", "SMTPUTF8", "SIZE=200"]);
        assert_eq!(args.get("SIZE").unwrap(), "200");
        assert_eq!(args.get("SMTPUTF8").unwrap(), "");
    }

    #[test]
    fn hello_argument_takes_first_token() {
        assert_eq!(parse_hello_argument("example.com extra").unwrap(), "example.com");
    }

    #[test]
    fn hello_argument_rejects_empty() {
        assert!(parse_hello_argument("").is_err());
        assert!(parse_hello_argument(" ").is_err());
    }

    #[test]
    fn xtext_roundtrips_printable_ascii() {
        assert_eq!(decode_xtext("hello").unwrap(), "hello");
        assert_eq!(decode_xtext("a+2Bb").unwrap(), "a+b");
    }

    #[test]
    fn xtext_rejects_incomplete_escape() {
        assert!(decode_xtext("+2").is_err());
        assert!(decode_xtext("+ZZ").is_err());
    }

    #[test]
    fn xtext_encode_escapes_plus_and_equals() {
        let encoded = encode_xtext("a+b=c");
        assert_eq!(decode_xtext(&encoded).unwrap(), "a+b=c");
    }
}
