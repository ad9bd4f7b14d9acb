//! Byte-to-text decoding with a total fallback chain
//!
//! Analyzers are inconsistent about text encodings, and a corrupted frame
//! must degrade decoding quality rather than abort the session. The chain
//! is: configured encoding (strict) → ASCII with NUL bytes stripped →
//! lossy UTF-8. [`decode`] always returns a string.

use serde::{Deserialize, Serialize};

/// Encodings an instrument can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    Utf8,
    Ascii,
    Latin1,
}

/// Result of a decode, with a flag for diagnostic logging when the
/// configured path was not usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    /// True when the configured encoding failed or replacement characters
    /// were substituted
    pub lossy: bool,
}

/// Decode `bytes` to text. Total: a malformed sequence falls through the
/// chain instead of erroring.
pub fn decode(bytes: &[u8], configured: Option<TextEncoding>) -> Decoded {
    if let Some(encoding) = configured {
        if let Some(text) = try_strict(bytes, encoding) {
            return Decoded { text, lossy: false };
        }
    }

    // Single-byte interpretation with NUL padding stripped; some analyzers
    // pad records with 0x00.
    let stripped: Vec<u8> = bytes.iter().copied().filter(|&b| b != 0x00).collect();
    if stripped.is_ascii() {
        return Decoded {
            text: String::from_utf8_lossy(&stripped).into_owned(),
            lossy: configured.is_some(),
        };
    }

    // Universal fallback; never fails.
    match std::str::from_utf8(bytes) {
        Ok(text) => Decoded {
            text: text.to_owned(),
            lossy: configured.is_some(),
        },
        Err(_) => Decoded {
            text: String::from_utf8_lossy(bytes).into_owned(),
            lossy: true,
        },
    }
}

fn try_strict(bytes: &[u8], encoding: TextEncoding) -> Option<String> {
    match encoding {
        TextEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
        TextEncoding::Ascii => {
            if bytes.is_ascii() {
                Some(String::from_utf8_lossy(bytes).into_owned())
            } else {
                None
            }
        }
        // Every byte maps to a code point; total by construction.
        TextEncoding::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
    }
}
