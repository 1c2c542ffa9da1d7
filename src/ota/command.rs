//! Extraction of the firmware url from an MQTT command payload.
//!
//! Command producers send `{"ota_endpoint": "<url>"}`. The scanner walks the
//! payload once and stops at the first matching key, so a payload only costs
//! as many tokens as it takes to reach the url. Tokens are counted the way a
//! flat JSON tokenizer counts them: every object, array, string (keys
//! included) and primitive is one token.

use serde::Serialize;

/// Key carrying the firmware url.
pub const ENDPOINT_KEY: &str = "ota_endpoint";

/// Longest url accepted, in bytes.
pub const MAX_URL_LEN: usize = 99;

/// Tokens the scanner may consume before giving up.
pub const TOKEN_BUDGET: usize = 10;

/// Firmware url extracted from a command. Empty means "no command".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OtaEndpoint {
    url: String,
}

impl OtaEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_empty()
    }
}

/// Scan `payload` for the first `ota_endpoint` string value.
///
/// Anything that prevents reaching a string value within [`TOKEN_BUDGET`]
/// tokens yields an empty endpoint: a missing key, malformed input, a
/// non-string value or an oversized url.
pub fn parse_ota_endpoint(payload: &[u8]) -> OtaEndpoint {
    let start = match payload.iter().position(|b| *b == b'{') {
        Some(start) => start,
        None => {
            debug!("ota::command: no json object in {} byte payload", payload.len());
            return OtaEndpoint::default();
        }
    };

    let url = match Scanner::new(&payload[start..]).find(ENDPOINT_KEY) {
        Some(url) => url,
        None => {
            debug!("ota::command: no {} within {} tokens", ENDPOINT_KEY, TOKEN_BUDGET);
            return OtaEndpoint::default();
        }
    };

    if url.len() > MAX_URL_LEN {
        warn!(
            "ota::command: endpoint of {} bytes exceeds {} byte limit, ignored",
            url.len(),
            MAX_URL_LEN
        );
        return OtaEndpoint::default();
    }

    OtaEndpoint::new(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

struct Scanner<'a> {
    input: &'a [u8],
    pos: usize,
    tokens: usize,
    stack: Vec<Container>,
    /// Next string in the current object is a key.
    expect_key: bool,
    /// The last key matched and its value has not been seen yet.
    pending: bool,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            tokens: 0,
            stack: Vec::new(),
            expect_key: false,
            pending: false,
        }
    }

    fn top(&self) -> Option<Container> {
        self.stack.last().copied()
    }

    fn count_token(&mut self) -> Option<()> {
        self.tokens += 1;
        (self.tokens <= TOKEN_BUDGET).then_some(())
    }

    fn find(mut self, key: &str) -> Option<String> {
        while let Some(&byte) = self.input.get(self.pos) {
            match byte {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'{' | b'[' => {
                    self.count_token()?;
                    self.pending = false;
                    let container = if byte == b'{' {
                        Container::Object
                    } else {
                        Container::Array
                    };
                    self.stack.push(container);
                    self.expect_key = container == Container::Object;
                    self.pos += 1;
                }
                b'}' | b']' => {
                    let expected = if byte == b'}' {
                        Container::Object
                    } else {
                        Container::Array
                    };
                    if self.stack.pop()? != expected {
                        return None;
                    }
                    // The outermost object ended without a match.
                    if self.stack.is_empty() {
                        return None;
                    }
                    self.expect_key = false;
                    self.pending = false;
                    self.pos += 1;
                }
                b':' => {
                    if self.top()? != Container::Object {
                        return None;
                    }
                    self.pos += 1;
                }
                b',' => {
                    self.expect_key = self.top()? == Container::Object;
                    self.pending = false;
                    self.pos += 1;
                }
                b'"' => {
                    self.count_token()?;
                    let text = self.string()?;
                    if self.expect_key && self.top() == Some(Container::Object) {
                        self.expect_key = false;
                        self.pending = text == key;
                    } else if self.pending {
                        return Some(text);
                    }
                }
                _ => {
                    if self.expect_key {
                        return None;
                    }
                    self.count_token()?;
                    self.primitive()?;
                    self.pending = false;
                }
            }
        }

        None
    }

    /// Reads a string starting at the opening quote, decoding escapes.
    fn string(&mut self) -> Option<String> {
        self.pos += 1;
        let mut out = Vec::new();

        loop {
            let byte = *self.input.get(self.pos)?;
            self.pos += 1;
            match byte {
                b'"' => return String::from_utf8(out).ok(),
                b'\\' => {
                    let escape = *self.input.get(self.pos)?;
                    self.pos += 1;
                    match escape {
                        b'"' => out.push(b'"'),
                        b'\\' => out.push(b'\\'),
                        b'/' => out.push(b'/'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'u' => {
                            let c = self.unicode_escape()?;
                            let mut buf = [0u8; 4];
                            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                        }
                        _ => return None,
                    }
                }
                0x00..=0x1f => return None,
                _ => out.push(byte),
            }
        }
    }

    fn hex4(&mut self) -> Option<u32> {
        let digits = self.input.get(self.pos..self.pos + 4)?;
        let digits = std::str::from_utf8(digits).ok()?;
        let value = u32::from_str_radix(digits, 16).ok()?;
        self.pos += 4;
        Some(value)
    }

    fn unicode_escape(&mut self) -> Option<char> {
        let high = self.hex4()?;
        if !(0xd800..0xdc00).contains(&high) {
            return char::from_u32(high);
        }

        // Surrogate pair.
        if self.input.get(self.pos..self.pos + 2)? != b"\\u" {
            return None;
        }
        self.pos += 2;
        let low = self.hex4()?;
        if !(0xdc00..0xe000).contains(&low) {
            return None;
        }
        char::from_u32(0x10000 + ((high - 0xd800) << 10) + (low - 0xdc00))
    }

    /// Skips a number, `true`, `false` or `null`.
    fn primitive(&mut self) -> Option<()> {
        let start = self.pos;
        while let Some(&byte) = self.input.get(self.pos) {
            match byte {
                b' ' | b'\t' | b'\r' | b'\n' | b',' | b']' | b'}' | b':' => break,
                0x20..=0x7e => self.pos += 1,
                _ => return None,
            }
        }
        (self.pos > start).then_some(())
    }
}
