//! Framing and tokenizing helpers for the newline-framed command protocol.
//!
//! A message is one WebSocket data frame. Its first line is a
//! whitespace-separated command; anything after the first newline is an
//! opaque payload that only the receiving endpoint interprets.

use std::borrow::Cow;

/// First line that ends a connection's read loop.
pub const EOF_MESSAGE: &str = "eof";

/// Marker announcing that the next frame carries a large payload.
pub const NEXT_MESSAGE_MARKER: &str = "nextmessage:";

/// Returns the first line of a message (everything before the first `\n`).
pub fn first_line(data: &[u8]) -> Cow<'_, str> {
    let end = data.iter().position(|&b| b == b'\n').unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end])
}

/// True when the whole message is its first line (no trailing payload).
pub fn is_single_line(data: &[u8]) -> bool {
    !data.contains(&b'\n')
}

/// Split a command line into its non-empty tokens.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Value of a `name=value` token, if the token carries that name.
pub fn token_value<'a>(token: &'a str, name: &str) -> Option<&'a str> {
    token
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('='))
}

/// Integer value of a `name=<int>` token. Trailing garbage is rejected.
pub fn token_integer(token: &str, name: &str) -> Option<i64> {
    token_value(token, name)?.parse().ok()
}

/// Finds the first `name=value` token among `tokens`.
pub fn find_token<'a>(tokens: &[&'a str], name: &str) -> Option<&'a str> {
    tokens.iter().find_map(|t| token_value(t, name))
}

/// Declared size of a `nextmessage: size=<N>` line.
///
/// Only an exactly-two-token line with a positive integer size qualifies;
/// anything else is an ordinary command.
pub fn next_message_size(tokens: &[&str]) -> Option<usize> {
    match tokens {
        [marker, size] if *marker == NEXT_MESSAGE_MARKER => {
            let size = token_integer(size, "size")?;
            usize::try_from(size).ok().filter(|&n| n > 0)
        }
        _ => None,
    }
}

/// Short printable form of a message for logs.
pub fn abbreviate(data: &[u8]) -> String {
    const MAX: usize = 120;
    let line = first_line(data);
    let truncated = line.chars().count() > MAX || !is_single_line(data);
    let mut out: String = line.chars().take(MAX).collect();
    if truncated {
        out.push_str("...");
    }
    out
}
