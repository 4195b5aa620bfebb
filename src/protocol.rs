//! Text protocol parser and response builder.
//!
//! Commands are single lines terminated by `\r\n`. Storage commands
//! (`set`, `add`, `replace`) declare the size of a data block that
//! follows the line; the block is terminated by its own `\r\n`. The
//! parser only consumes command lines — assembling the data block is the
//! connection's job, which asks [`Command::expects_data`] whether one is
//! coming.

use thiserror::Error;

/// Maximum key length accepted on the wire.
pub const MAX_KEY_LENGTH: usize = 250;

/// Maximum declared data block size.
pub const MAX_VALUE_SIZE: usize = 8 * 1024 * 1024;

/// A parsed protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `set <key> <bytes>` — unconditional store.
    Set { key: Vec<u8> },
    /// `add <key> <bytes>` — store only when absent.
    Add { key: Vec<u8> },
    /// `replace <key> <bytes>` — store only when present.
    Replace { key: Vec<u8> },
    /// `get <key>`
    Get { key: Vec<u8> },
    /// `delete <key>`
    Delete { key: Vec<u8> },
    Stats,
    Version,
    Quit,
}

impl Command {
    /// Storage commands carry a byte-counted data block after the
    /// command line (terminated by `\r\n`, even when zero-length).
    pub fn expects_data(&self) -> bool {
        matches!(
            self,
            Command::Set { .. } | Command::Add { .. } | Command::Replace { .. }
        )
    }
}

/// Protocol parsing errors. All of these are client faults: the
/// connection answers `ERROR` and resynchronizes at the next line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("malformed command: {0}")]
    Malformed(&'static str),
    #[error("key exceeds {MAX_KEY_LENGTH} bytes")]
    KeyTooLong,
    #[error("invalid data length")]
    InvalidLength,
    #[error("data length exceeds {MAX_VALUE_SIZE} bytes")]
    ValueTooLarge,
}

/// A command line parsed off the wire. `arg_len` is the declared size of
/// the data block that follows (zero for inline commands); `consumed`
/// covers the command line including its terminator.
#[derive(Debug, PartialEq, Eq)]
pub struct Parsed {
    pub command: Command,
    pub arg_len: usize,
    pub consumed: usize,
}

/// Parser for the text protocol.
pub struct Parser;

impl Parser {
    /// Parse one command line from `input`. `Ok(None)` means no complete
    /// line has arrived yet.
    pub fn parse(input: &[u8]) -> Result<Option<Parsed>, ParseError> {
        let Some(line_end) = find_crlf(input) else {
            return Ok(None);
        };
        let consumed = line_end + 2;
        let line = &input[..line_end];
        let mut parts = line
            .split(|b: &u8| *b == b' ' || *b == b'\t')
            .filter(|token| !token.is_empty());

        let Some(name_token) = parts.next() else {
            return Err(ParseError::Malformed("empty command line"));
        };
        let name = std::str::from_utf8(name_token)
            .map_err(|_| ParseError::Malformed("non-ascii command name"))?
            .to_lowercase();

        let (command, arg_len) = match name.as_str() {
            "set" | "add" | "replace" => {
                let key = take_key(&mut parts)?;
                let len_token = parts
                    .next()
                    .ok_or(ParseError::Malformed("missing data length"))?;
                let arg_len = parse_len(len_token)?;
                let command = match name.as_str() {
                    "set" => Command::Set { key },
                    "add" => Command::Add { key },
                    _ => Command::Replace { key },
                };
                (command, arg_len)
            }
            "get" => (Command::Get { key: take_key(&mut parts)? }, 0),
            "delete" => (Command::Delete { key: take_key(&mut parts)? }, 0),
            "stats" => (Command::Stats, 0),
            "version" => (Command::Version, 0),
            "quit" => (Command::Quit, 0),
            _ => return Err(ParseError::UnknownCommand(name)),
        };

        if parts.next().is_some() {
            return Err(ParseError::Malformed("unexpected trailing arguments"));
        }

        Ok(Some(Parsed {
            command,
            arg_len,
            consumed,
        }))
    }
}

fn take_key<'a>(parts: &mut impl Iterator<Item = &'a [u8]>) -> Result<Vec<u8>, ParseError> {
    let token = parts.next().ok_or(ParseError::Malformed("missing key"))?;
    if token.len() > MAX_KEY_LENGTH {
        return Err(ParseError::KeyTooLong);
    }
    Ok(token.to_vec())
}

fn parse_len(token: &[u8]) -> Result<usize, ParseError> {
    let text = std::str::from_utf8(token).map_err(|_| ParseError::InvalidLength)?;
    let len: usize = text.parse().map_err(|_| ParseError::InvalidLength)?;
    if len > MAX_VALUE_SIZE {
        return Err(ParseError::ValueTooLarge);
    }
    Ok(len)
}

/// Position of the first `\r\n` in `buffer`.
pub fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\r\n")
}

/// Index just past the next `\r\n`, for resynchronizing after a parse
/// error.
pub fn find_recovery_point(buffer: &[u8]) -> Option<usize> {
    find_crlf(buffer).map(|pos| pos + 2)
}

/// Response builder. Replies carry no trailing `\r\n`; the connection
/// appends the line terminator when it queues them.
pub struct Response;

impl Response {
    pub fn error() -> Vec<u8> {
        b"ERROR".to_vec()
    }

    pub fn stored() -> Vec<u8> {
        b"STORED".to_vec()
    }

    pub fn not_stored() -> Vec<u8> {
        b"NOT_STORED".to_vec()
    }

    pub fn deleted() -> Vec<u8> {
        b"DELETED".to_vec()
    }

    pub fn not_found() -> Vec<u8> {
        b"NOT_FOUND".to_vec()
    }

    pub fn end() -> Vec<u8> {
        b"END".to_vec()
    }

    /// `VALUE <key> <len>` line, the data block, and the END marker.
    pub fn value(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(key.len() + data.len() + 24);
        out.extend_from_slice(b"VALUE ");
        out.extend_from_slice(key);
        out.extend_from_slice(format!(" {}\r\n", data.len()).as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\nEND");
        out
    }

    pub fn stats(items: usize, bytes: usize, limit: usize) -> Vec<u8> {
        format!(
            "STAT curr_items {items}\r\nSTAT bytes {bytes}\r\nSTAT limit_maxbytes {limit}\r\nEND"
        )
        .into_bytes()
    }

    pub fn version() -> Vec<u8> {
        format!("VERSION {}", env!("CARGO_PKG_VERSION")).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_storage_command() {
        let parsed = Parser::parse(b"set foo 3\r\nbar\r\n").unwrap().unwrap();
        assert_eq!(parsed.command, Command::Set { key: b"foo".to_vec() });
        assert_eq!(parsed.arg_len, 3);
        assert_eq!(parsed.consumed, 11);
        assert!(parsed.command.expects_data());
    }

    #[test]
    fn parses_zero_length_data_block() {
        let parsed = Parser::parse(b"set empty 0\r\n").unwrap().unwrap();
        assert_eq!(parsed.arg_len, 0);
        assert!(parsed.command.expects_data());
    }

    #[test]
    fn parses_inline_commands() {
        let parsed = Parser::parse(b"get foo\r\n").unwrap().unwrap();
        assert_eq!(parsed.command, Command::Get { key: b"foo".to_vec() });
        assert_eq!(parsed.arg_len, 0);
        assert!(!parsed.command.expects_data());

        let parsed = Parser::parse(b"delete foo\r\n").unwrap().unwrap();
        assert_eq!(parsed.command, Command::Delete { key: b"foo".to_vec() });

        assert_eq!(
            Parser::parse(b"stats\r\n").unwrap().unwrap().command,
            Command::Stats
        );
        assert_eq!(
            Parser::parse(b"version\r\n").unwrap().unwrap().command,
            Command::Version
        );
        assert_eq!(
            Parser::parse(b"quit\r\n").unwrap().unwrap().command,
            Command::Quit
        );
    }

    #[test]
    fn incomplete_line_yields_none() {
        assert_eq!(Parser::parse(b"").unwrap(), None);
        assert_eq!(Parser::parse(b"set foo 3").unwrap(), None);
        assert_eq!(Parser::parse(b"set foo 3\r").unwrap(), None);
    }

    #[test]
    fn consumed_stops_at_the_line_terminator() {
        let parsed = Parser::parse(b"get a\r\nget b\r\n").unwrap().unwrap();
        assert_eq!(parsed.command, Command::Get { key: b"a".to_vec() });
        assert_eq!(parsed.consumed, 7);
    }

    #[test]
    fn collapses_repeated_whitespace() {
        let parsed = Parser::parse(b"set   foo\t 3\r\n").unwrap().unwrap();
        assert_eq!(parsed.command, Command::Set { key: b"foo".to_vec() });
        assert_eq!(parsed.arg_len, 3);
    }

    #[test]
    fn command_names_are_case_insensitive() {
        let parsed = Parser::parse(b"GET foo\r\n").unwrap().unwrap();
        assert_eq!(parsed.command, Command::Get { key: b"foo".to_vec() });
    }

    #[test]
    fn rejects_unknown_command() {
        assert_eq!(
            Parser::parse(b"frobnicate foo\r\n"),
            Err(ParseError::UnknownCommand("frobnicate".to_string()))
        );
    }

    #[test]
    fn rejects_missing_arguments() {
        assert!(matches!(
            Parser::parse(b"set foo\r\n"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            Parser::parse(b"get\r\n"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            Parser::parse(b"\r\n"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_trailing_arguments() {
        assert!(matches!(
            Parser::parse(b"get foo bar\r\n"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            Parser::parse(b"quit now\r\n"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_bad_lengths() {
        assert_eq!(
            Parser::parse(b"set foo abc\r\n"),
            Err(ParseError::InvalidLength)
        );
        assert_eq!(
            Parser::parse(b"set foo -1\r\n"),
            Err(ParseError::InvalidLength)
        );
        let oversized = format!("set foo {}\r\n", MAX_VALUE_SIZE + 1);
        assert_eq!(
            Parser::parse(oversized.as_bytes()),
            Err(ParseError::ValueTooLarge)
        );
    }

    #[test]
    fn rejects_oversized_key() {
        let long_key = vec![b'k'; MAX_KEY_LENGTH + 1];
        let mut line = b"get ".to_vec();
        line.extend_from_slice(&long_key);
        line.extend_from_slice(b"\r\n");
        assert_eq!(Parser::parse(&line), Err(ParseError::KeyTooLong));
    }

    #[test]
    fn value_response_layout() {
        let out = Response::value(b"k", b"abc");
        assert_eq!(out, b"VALUE k 3\r\nabc\r\nEND");
    }
}
