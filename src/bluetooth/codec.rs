// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request encoding and response decoding for the text protocol.
//!
//! The device answers the identification query with a hex token such as
//! `0x00AB`, usually followed by a line terminator.

use thiserror::Error;

/// The only command ever sent to the device.
pub const REQUEST_TEXT: &str = "%#IDN?\r";

/// Literal prefix stripped from a response before parsing.
const HEX_PREFIX: &str = "0x";

/// Errors produced while decoding a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("not a hex value: {0:?}")]
    NotHex(String),
}

/// Encode the request as raw bytes.
pub fn encode_request() -> Vec<u8> {
    REQUEST_TEXT.as_bytes().to_vec()
}

/// Decode a response into a 16-bit value.
///
/// Surrounding whitespace is ignored. An exact `0x` prefix is stripped when
/// present; otherwise the whole token is parsed as hex. Values wider than
/// 16 bits keep their low 16 bits.
pub fn decode_response(text: &str) -> Result<u16, ParseError> {
    let token = text.trim();
    let digits = token.strip_prefix(HEX_PREFIX).unwrap_or(token);

    if digits.is_empty() {
        return Err(ParseError::NotHex(token.to_string()));
    }

    // Any number of digits is accepted; shifting through a u16 keeps only
    // the low 16 bits, where `u16::from_str_radix` would reject the input.
    let mut value: u16 = 0;
    for c in digits.chars() {
        let nibble = c
            .to_digit(16)
            .ok_or_else(|| ParseError::NotHex(token.to_string()))?;
        value = (value << 4) | nibble as u16;
    }

    Ok(value)
}

/// Render a value in the 2-byte big-endian wire layout.
pub fn to_wire_bytes(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// One chunk received from the device.
#[derive(Debug, Clone)]
pub struct Frame {
    pub raw: Vec<u8>,
    pub text: String,
    pub parsed: Result<u16, ParseError>,
}

impl Frame {
    /// Build a frame from a raw read, decoding it on the way.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw).into_owned();
        let parsed = decode_response(&text);
        Self {
            raw: raw.to_vec(),
            text,
            parsed,
        }
    }

    /// The decoded value, if any.
    pub fn value(&self) -> Option<u16> {
        self.parsed.as_ref().ok().copied()
    }
}

/// Format wire bytes for display, e.g. `00 AB`.
pub fn format_wire_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_is_stable() {
        let first = encode_request();
        let second = encode_request();
        assert_eq!(first, second);
        assert_eq!(first, b"%#IDN?\r".to_vec());
        assert_eq!(first.last(), Some(&b'\r'));
    }

    #[test]
    fn test_decode_with_prefix() {
        assert_eq!(decode_response("0x00AB"), Ok(0x00AB));
        assert_eq!(decode_response("0x00AB\r\n"), Ok(171));
        assert_eq!(decode_response("  0xff  "), Ok(0xFF));
    }

    #[test]
    fn test_decode_without_prefix_falls_back() {
        assert_eq!(decode_response("1234"), Ok(0x1234));
        assert_eq!(decode_response("beef\n"), Ok(0xBEEF));
    }

    #[test]
    fn test_decode_truncates_to_16_bits() {
        assert_eq!(decode_response("0x12345"), Ok(0x2345));
        assert_eq!(decode_response("0xDEADBEEF"), Ok(0xBEEF));
        assert_eq!(decode_response("FFFFFFFFFFFFFFFFFFFF0001"), Ok(0x0001));
    }

    #[test]
    fn test_decode_rejects_non_hex() {
        assert!(matches!(decode_response("hello"), Err(ParseError::NotHex(_))));
        assert!(matches!(decode_response("0x"), Err(ParseError::NotHex(_))));
        assert!(matches!(decode_response(""), Err(ParseError::NotHex(_))));
        assert!(matches!(decode_response("0x12G4"), Err(ParseError::NotHex(_))));
        assert!(matches!(decode_response("+12"), Err(ParseError::NotHex(_))));
    }

    #[test]
    fn test_prefix_match_is_case_sensitive() {
        // "0X" is not stripped, so the X makes the full-string parse fail.
        assert!(matches!(decode_response("0X1F"), Err(ParseError::NotHex(_))));
    }

    #[test]
    fn test_request_echo_is_not_a_value() {
        let echo = String::from_utf8(encode_request()).unwrap();
        assert!(decode_response(&echo).is_err());
    }

    #[test]
    fn test_wire_bytes_are_big_endian() {
        assert_eq!(to_wire_bytes(0x00AB), [0x00, 0xAB]);
        assert_eq!(to_wire_bytes(0x1234), [0x12, 0x34]);
        assert_eq!(format_wire_bytes(&to_wire_bytes(0x00AB)), "00 AB");
    }

    #[test]
    fn test_frame_from_bytes() {
        let frame = Frame::from_bytes(b"0x00AB\r\n");
        assert_eq!(frame.text, "0x00AB\r\n");
        assert_eq!(frame.value(), Some(0x00AB));

        let frame = Frame::from_bytes(b"OK\r\n");
        assert_eq!(frame.value(), None);
        assert_eq!(frame.raw, b"OK\r\n".to_vec());
    }
}
