//! Wire framing for commands embedded directly in the stderr byte stream.
//!
//! Local (fd-carrying) commands don't use this framing; see [`crate::agent`]
//! for how those are distinguished from plain stderr text.

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::literal::{self, Literal};

/// Byte template a remote command record is formatted from: `NUL "ferny"
/// NUL <payload> NUL NUL LF`. Exposed so callers who assemble a frame by
/// hand (e.g. for `LocalCommand=` snippets executed by `sh`) can match the
/// exact framing this crate's agent expects.
pub const COMMAND_TEMPLATE: &str = "\0ferny\0{}\0\0\n";

/// The regex used to split an accumulated stderr buffer into interleaved
/// plain-text chunks and framed command payloads.
pub static FRAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x00ferny\x00([^\n]*)\x00\x00\n").unwrap());

/// Render `(command, args)` as a remote command frame ready to be written
/// into a byte stream ssh's stderr is forwarded through.
pub fn encode_remote(command: &str, args: &[Literal]) -> Vec<u8> {
    let record = Literal::Tuple(vec![
        Literal::Str(command.to_owned()),
        Literal::Tuple(args.to_vec()),
    ]);
    let payload = literal::to_string(&record);
    format!("\0ferny\0{payload}\0\0\n").into_bytes()
}

/// Split `buffer` into a sequence of `(text, frame)` pairs followed by a
/// trailing remainder, mirroring `re.split` on [`FRAME_RE`].
///
/// Returns the extracted `(stderr_prefix, payload)` pairs in order, plus
/// whatever unmatched tail remains (to be kept as the new buffer).
pub fn split_frames(buffer: &[u8]) -> (Vec<(Vec<u8>, Vec<u8>)>, Vec<u8>) {
    let mut pairs = Vec::new();
    let mut pos = 0;
    loop {
        match FRAME_RE.captures(&buffer[pos..]) {
            Some(caps) => {
                let whole = caps.get(0).unwrap();
                let payload = caps.get(1).unwrap();
                let prefix = buffer[pos..pos + whole.start()].to_vec();
                let payload = payload.as_bytes().to_vec();
                pos += whole.end();
                pairs.push((prefix, payload));
            }
            None => {
                return (pairs, buffer[pos..].to_vec());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_matching_command_template() {
        let frame = encode_remote("bzzt", &[Literal::Int(1), Literal::Int(2), Literal::Int(3)]);
        assert_eq!(frame, b"\0ferny\0('bzzt', (1, 2, 3))\0\0\n");
    }

    #[test]
    fn splits_interleaved_text_and_frames() {
        let mut buf = b"warn: one\n".to_vec();
        buf.extend_from_slice(&encode_remote("ferny.end", &[]));
        buf.extend_from_slice(b"trailing");
        let (pairs, tail) = split_frames(&buf);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, b"warn: one\n");
        assert_eq!(pairs[0].1, b"('ferny.end', ())");
        assert_eq!(tail, b"trailing");
    }

    #[test]
    fn no_frame_keeps_everything_as_tail() {
        let (pairs, tail) = split_frames(b"just some stderr text\n");
        assert!(pairs.is_empty());
        assert_eq!(tail, b"just some stderr text\n");
    }
}
