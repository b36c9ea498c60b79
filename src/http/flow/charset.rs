//! Incremental text decoding for body adapters

use encoding_rs::{CoderResult, Encoding};
use std::fmt;

/// Character set used by the text adapters
///
/// Labels are resolved with the WHATWG rules of `encoding_rs`, so
/// `iso-8859-1` and `us-ascii` decode as windows-1252.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Charset(&'static Encoding);

impl Charset {
    pub fn utf8() -> Charset {
        Charset(encoding_rs::UTF_8)
    }

    pub fn utf16be() -> Charset {
        Charset(encoding_rs::UTF_16BE)
    }

    pub fn utf16le() -> Charset {
        Charset(encoding_rs::UTF_16LE)
    }

    pub fn iso_8859_1() -> Charset {
        Charset(encoding_rs::WINDOWS_1252)
    }

    /// Look a charset up by one of its labels
    pub fn from_name(name: &str) -> Option<Charset> {
        let name = name.trim().trim_matches('"');
        Encoding::for_label(name.as_bytes()).map(Charset)
    }

    /// Charset named by a `Content-Type` value, UTF-8 otherwise
    pub fn from_content_type(content_type: Option<&str>) -> Charset {
        content_type
            .and_then(|ct| {
                ct.split(';').skip(1).find_map(|param| {
                    let (key, value) = param.split_once('=')?;
                    if key.trim().eq_ignore_ascii_case("charset") {
                        Charset::from_name(value)
                    } else {
                        None
                    }
                })
            })
            .unwrap_or_default()
    }

    pub fn name(self) -> &'static str {
        self.0.name()
    }

    /// Decode a complete byte sequence
    pub fn decode(self, bytes: &[u8]) -> String {
        let (text, _) = self.0.decode_without_bom_handling(bytes);
        text.into_owned()
    }
}

impl Default for Charset {
    fn default() -> Self {
        Charset::utf8()
    }
}

impl fmt::Debug for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Charset({})", self.0.name())
    }
}

/// Streaming decoder that carries partial characters across chunks
///
/// Malformed input decodes to U+FFFD. A sequence cut off by the end of the
/// stream becomes a single U+FFFD when [`finish`](Decoder::finish) runs.
pub struct Decoder {
    charset: Charset,
    inner: encoding_rs::Decoder,
}

impl Decoder {
    pub fn new(charset: Charset) -> Self {
        Decoder {
            charset,
            inner: charset.0.new_decoder_without_bom_handling(),
        }
    }

    /// Decode `bytes`, appending complete characters to `out`
    pub fn feed(&mut self, bytes: &[u8], out: &mut String) {
        self.decode(bytes, out, false);
    }

    /// Flush any dangling partial character
    ///
    /// The decoder starts over afterwards.
    pub fn finish(&mut self, out: &mut String) {
        self.decode(&[], out, true);
        self.inner = self.charset.0.new_decoder_without_bom_handling();
    }

    fn decode(&mut self, mut src: &[u8], out: &mut String, last: bool) {
        loop {
            let room = self
                .inner
                .max_utf8_buffer_length(src.len())
                .unwrap_or(src.len().saturating_mul(3).saturating_add(4));
            out.reserve(room);
            let (result, read, _) = self.inner.decode_to_string(src, out, last);
            src = &src[read..];
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => continue,
            }
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("charset", &self.charset)
            .finish_non_exhaustive()
    }
}
