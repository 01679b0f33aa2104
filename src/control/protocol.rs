//! Wire protocol for control channels.
//!
//! Requests are single text lines. Every response is framed as a fixed-width
//! header followed by the body:
//!
//! ```text
//! SSS LLLLLLLL\n        status (3 digits), body length (padded to 8)
//! <body>\n
//! ```
//!
//! The header makes it possible for a client to read exactly one response
//! without scanning for a terminator inside the body.

use std::fmt;

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    /// Malformed request line.
    Syntax = 100,
    /// No such command.
    Unknown = 101,
    /// Not implemented.
    Unimplemented = 102,
    /// Missing arguments.
    TooFew = 104,
    /// Surplus arguments.
    TooMany = 105,
    /// Parameter rejected the value.
    Param = 106,
    /// Authentication required; body carries the challenge.
    Auth = 107,
    /// Success.
    Ok = 200,
    /// Success, but the body was truncated.
    Truncated = 201,
    /// Valid request that cannot be carried out right now.
    Cant = 300,
    /// Communication with a collaborator failed.
    Comms = 400,
    /// The channel is being closed.
    Close = 500,
}

impl Status {
    /// Numeric code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Look a code up.
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            100 => Status::Syntax,
            101 => Status::Unknown,
            102 => Status::Unimplemented,
            104 => Status::TooFew,
            105 => Status::TooMany,
            106 => Status::Param,
            107 => Status::Auth,
            200 => Status::Ok,
            201 => Status::Truncated,
            300 => Status::Cant,
            400 => Status::Comms,
            500 => Status::Close,
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One response: status plus text body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Outcome.
    pub status: Status,
    /// Body text, without the trailing newline added by framing.
    pub body: String,
}

impl Reply {
    /// Build a reply.
    pub fn new(status: Status, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A 200 reply.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(Status::Ok, body)
    }

    /// Cut the body down to `limit` bytes, marking the reply as truncated.
    pub fn truncate(mut self, limit: usize) -> Self {
        if self.body.len() <= limit {
            return self;
        }
        let mut cut = limit;
        while !self.body.is_char_boundary(cut) {
            cut -= 1;
        }
        self.body.truncate(cut);
        if self.status == Status::Ok {
            self.status = Status::Truncated;
        }
        self
    }

    /// Serialize with the status/length header.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{:<3} {:<8}\n", self.status.code(), self.body.len()).into_bytes();
        out.extend_from_slice(self.body.as_bytes());
        out.push(b'\n');
        out
    }

    /// Parse one encoded reply. Returns the reply and the bytes consumed.
    pub fn decode(buf: &[u8]) -> Option<(Reply, usize)> {
        const HEADER: usize = 13;
        if buf.len() < HEADER || buf[HEADER - 1] != b'\n' {
            return None;
        }
        let header = std::str::from_utf8(&buf[..HEADER - 1]).ok()?;
        let mut fields = header.split_whitespace();
        let status = Status::from_code(fields.next()?.parse().ok()?)?;
        let len: usize = fields.next()?.parse().ok()?;
        let end = HEADER + len;
        if buf.len() < end + 1 {
            return None;
        }
        let body = String::from_utf8(buf[HEADER..end].to_vec()).ok()?;
        Some((Reply { status, body }, end + 1))
    }
}

/// Tokenizer failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizeError {
    /// A quoted string was not closed.
    UnterminatedQuote,
    /// Unknown backslash escape.
    BadEscape(char),
}

impl fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenizeError::UnterminatedQuote => f.write_str("Missing '\"'"),
            TokenizeError::BadEscape(c) => write!(f, "Invalid backslash escape \\{c}"),
        }
    }
}

/// Split a request line into words.
///
/// Words are separated by whitespace; double quotes group words and support
/// `\"`, `\\`, `\n` and `\t` escapes.
pub fn tokenize(line: &str) -> Result<Vec<String>, TokenizeError> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut word = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    None => return Err(TokenizeError::UnterminatedQuote),
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('"') => word.push('"'),
                        Some('\\') => word.push('\\'),
                        Some('n') => word.push('\n'),
                        Some('t') => word.push('\t'),
                        Some(c) => return Err(TokenizeError::BadEscape(c)),
                        None => return Err(TokenizeError::UnterminatedQuote),
                    },
                    Some(c) => word.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                word.push(c);
            }
        }
        words.push(word);
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_header_layout() {
        let bytes = Reply::ok("PONG").encode();
        assert_eq!(bytes, b"200 4       \nPONG\n");
    }

    #[test]
    fn test_decode_encoded() {
        let reply = Reply::new(Status::Auth, "abc\n\nAuthentication required.");
        let mut bytes = reply.encode();
        bytes.extend_from_slice(b"trailing");
        let (decoded, used) = Reply::decode(&bytes).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(&bytes[used..], b"trailing");
    }

    #[test]
    fn test_decode_incomplete() {
        let bytes = Reply::ok("hello").encode();
        assert!(Reply::decode(&bytes[..bytes.len() - 2]).is_none());
        assert!(Reply::decode(b"200 ").is_none());
    }

    #[test]
    fn test_truncate() {
        let reply = Reply::ok("abcdef").truncate(3);
        assert_eq!(reply.status, Status::Truncated);
        assert_eq!(reply.body, "abc");

        let untouched = Reply::ok("abc").truncate(3);
        assert_eq!(untouched.status, Status::Ok);

        let multibyte = Reply::new(Status::Cant, "aé").truncate(2);
        assert_eq!(multibyte.body, "a");
        assert_eq!(multibyte.status, Status::Cant);
    }

    #[test]
    fn test_tokenize_plain_and_quoted() {
        assert_eq!(tokenize("  param.set  a  b ").unwrap(), vec!["param.set", "a", "b"]);
        assert_eq!(
            tokenize(r#"param.set x "two words" "q\"uote""#).unwrap(),
            vec!["param.set", "x", "two words", "q\"uote"]
        );
        assert!(tokenize("   ").unwrap().is_empty());
    }

    #[test]
    fn test_tokenize_errors() {
        assert_eq!(tokenize(r#"a "open"#), Err(TokenizeError::UnterminatedQuote));
        assert_eq!(tokenize(r#""\q""#), Err(TokenizeError::BadEscape('q')));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Auth.code(), 107);
        assert_eq!(Status::from_code(500), Some(Status::Close));
        assert_eq!(Status::from_code(999), None);
    }
}
