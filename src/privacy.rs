//! Privacy block decryption.
//!
//! The service stores text the author marked private as AES-128-ECB ciphertext
//! between two fixed markers. The key is the author's numeric account id,
//! rendered as a string and zero-padded (or truncated) to 16 bytes.

use std::sync::LazyLock;

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::error::DecodeError;

/// Marker the reader sees before recovered private text.
pub const PLAIN_BEGIN: &str = "[隐私内容开始]";
/// Marker the reader sees after recovered private text.
pub const PLAIN_END: &str = "[隐私内容结束]";

const BLOCK_SIZE: usize = 16;

// The service has shipped both full-width and ASCII commas in the markers.
static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[以下是隐私区域密文[,，]请不要做任何编辑[,，]否则可能导致解密失败\]([\s\S]+?)\[以上是隐私日记[,，]请不要编辑密文\]",
    )
    .expect("privacy block pattern is valid")
});

static ESCAPED_SURROGATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\ud83[cde]").expect("surrogate pattern is valid"));

/// What happened to one privacy block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    Decrypted { original: String, plaintext: String },
    Unchanged { original: String, reason: DecodeError },
}

impl BlockOutcome {
    /// Text that replaces the block in the diary body.
    pub fn replacement(&self) -> String {
        match self {
            BlockOutcome::Decrypted { plaintext, .. } => {
                format!("{}\n{}\n{}", PLAIN_BEGIN, plaintext, PLAIN_END)
            }
            BlockOutcome::Unchanged { original, .. } => original.clone(),
        }
    }
}

/// Derive the 16-byte AES key from the key material.
pub fn derive_key(key_material: &str) -> [u8; BLOCK_SIZE] {
    let mut key = [0u8; BLOCK_SIZE];
    let bytes = key_material.as_bytes();
    let n = bytes.len().min(BLOCK_SIZE);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

/// Decrypt every privacy block in `body`, leaving blocks that fail untouched.
pub fn decrypt(body: &str, key_material: &str) -> String {
    if !BLOCK_RE.is_match(body) {
        return body.to_string();
    }
    let cipher = Aes128::new(&GenericArray::from(derive_key(key_material)));
    BLOCK_RE
        .replace_all(body, |caps: &Captures| {
            let outcome = decrypt_block(&cipher, caps);
            if let BlockOutcome::Unchanged { reason, .. } = &outcome {
                warn!(reason = %reason, "privacy block left encrypted");
            }
            outcome.replacement()
        })
        .into_owned()
}

/// Per-block outcomes, in order of appearance.
pub fn decrypt_blocks(body: &str, key_material: &str) -> Vec<BlockOutcome> {
    let cipher = Aes128::new(&GenericArray::from(derive_key(key_material)));
    BLOCK_RE
        .captures_iter(body)
        .map(|caps| decrypt_block(&cipher, &caps))
        .collect()
}

fn decrypt_block(cipher: &Aes128, caps: &Captures) -> BlockOutcome {
    let original = caps[0].to_string();
    match decode_ciphertext(&caps[1]) {
        Ok(mut bytes) => {
            for chunk in bytes.chunks_exact_mut(BLOCK_SIZE) {
                cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
            }
            let plain = unpad(&bytes);
            debug!(bytes = plain.len(), "privacy block decrypted");
            BlockOutcome::Decrypted {
                original,
                plaintext: String::from_utf8_lossy(plain).into_owned(),
            }
        }
        Err(reason) => BlockOutcome::Unchanged { original, reason },
    }
}

#[derive(Clone, Copy)]
enum Encoding {
    Base64,
    Hex,
}

/// Turn the text between the markers into ciphertext bytes.
///
/// Base64 is tried first, then hex. Text made only of hex digits is also
/// valid base64, so for that shape hex goes first.
fn decode_ciphertext(text: &str) -> Result<Vec<u8>, DecodeError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(DecodeError::Empty);
    }

    let looks_hex = compact.len() % 2 == 0 && compact.bytes().all(|b| b.is_ascii_hexdigit());
    let order = if looks_hex {
        [Encoding::Hex, Encoding::Base64]
    } else {
        [Encoding::Base64, Encoding::Hex]
    };

    let mut misaligned = None;
    for encoding in order {
        let decoded = match encoding {
            Encoding::Base64 => STANDARD.decode(&compact).ok(),
            Encoding::Hex => hex::decode(&compact).ok(),
        };
        if let Some(bytes) = decoded {
            if !bytes.is_empty() && bytes.len() % BLOCK_SIZE == 0 {
                return Ok(bytes);
            }
            misaligned.get_or_insert(bytes.len());
        }
    }
    Err(match misaligned {
        Some(len) => DecodeError::Misaligned(len),
        None => DecodeError::NotEncoded,
    })
}

/// Strip PKCS#7 padding when it is consistent, then any zero padding.
fn unpad(bytes: &[u8]) -> &[u8] {
    let mut out = bytes;
    if let Some(&last) = out.last() {
        let n = last as usize;
        if (1..=BLOCK_SIZE).contains(&n)
            && n <= out.len()
            && out[out.len() - n..].iter().all(|&b| b == last)
        {
            out = &out[..out.len() - n];
        }
    }
    while let [rest @ .., 0] = out {
        out = rest;
    }
    out
}

/// Remove literal `\ud83c`-style escape remnants the service leaves behind
/// when it mangles emoji.
pub fn strip_escaped_surrogates(text: &str) -> String {
    ESCAPED_SURROGATE_RE.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;

    const BEGIN: &str = "[以下是隐私区域密文，请不要做任何编辑，否则可能导致解密失败]";
    const END: &str = "[以上是隐私日记，请不要编辑密文]";

    fn encrypt(plaintext: &str, key_material: &str) -> Vec<u8> {
        let cipher = Aes128::new(&GenericArray::from(derive_key(key_material)));
        let mut data = plaintext.as_bytes().to_vec();
        let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
        data.extend(std::iter::repeat_n(pad as u8, pad));
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        data
    }

    #[test]
    fn key_is_zero_padded_or_truncated() {
        assert_eq!(&derive_key("12345"), b"12345\0\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(&derive_key("123456789012345678"), b"1234567890123456");
    }

    #[test]
    fn body_without_markers_is_identity() {
        for body in ["", "普通的一天", "[以下是隐私区域密文", "a [图1] b"] {
            assert_eq!(decrypt(body, "12345"), body);
        }
    }

    #[test]
    fn hex_block_decrypts() {
        let cipher = hex::encode(encrypt("今天的秘密", "12345"));
        let body = format!("{}{}{}", BEGIN, cipher, END);
        assert_eq!(
            decrypt(&body, "12345"),
            "[隐私内容开始]\n今天的秘密\n[隐私内容结束]"
        );
    }

    #[test]
    fn multi_block_hex_is_not_mistaken_for_base64() {
        let text = "a longer secret spanning more than one AES block";
        let cipher = hex::encode(encrypt(text, "12345"));
        assert!(cipher.len() > 64);
        let body = format!("{}{}{}", BEGIN, cipher, END);
        assert!(decrypt(&body, "12345").contains(text));
    }

    #[test]
    fn base64_block_and_surrounding_text() {
        let cipher = STANDARD.encode(encrypt("line one\nline two", "777"));
        let body = format!("before\n{}\n{}\n{}\nafter", BEGIN, cipher, END);
        let out = decrypt(&body, "777");
        assert_eq!(
            out,
            "before\n[隐私内容开始]\nline one\nline two\n[隐私内容结束]\nafter"
        );
    }

    #[test]
    fn ascii_comma_markers_are_recognised() {
        let cipher = STANDARD.encode(encrypt("x", "1"));
        let body = format!(
            "[以下是隐私区域密文,请不要做任何编辑,否则可能导致解密失败]{}[以上是隐私日记,请不要编辑密文]",
            cipher
        );
        assert_eq!(decrypt(&body, "1"), "[隐私内容开始]\nx\n[隐私内容结束]");
    }

    #[test]
    fn undecodable_block_is_left_alone() {
        let body = format!("keep {}not cipher text!{} this", BEGIN, END);
        assert_eq!(decrypt(&body, "1"), body);
        let outcomes = decrypt_blocks(&body, "1");
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0],
            BlockOutcome::Unchanged { reason: DecodeError::NotEncoded, .. }
        ));
    }

    #[test]
    fn blocks_are_independent() {
        let good = STANDARD.encode(encrypt("ok", "5"));
        let body = format!("{BEGIN}%%%{END} / {BEGIN}{good}{END}");
        let outcomes = decrypt_blocks(&body, "5");
        assert!(matches!(outcomes[0], BlockOutcome::Unchanged { .. }));
        assert!(matches!(&outcomes[1], BlockOutcome::Decrypted { plaintext, .. } if plaintext == "ok"));
        let out = decrypt(&body, "5");
        assert!(out.starts_with(BEGIN));
        assert!(out.ends_with("[隐私内容开始]\nok\n[隐私内容结束]"));
    }

    #[test]
    fn misaligned_ciphertext_is_reported() {
        let body = format!("{BEGIN}{}{END}", STANDARD.encode([1u8; 10]));
        let outcomes = decrypt_blocks(&body, "5");
        assert!(matches!(
            outcomes[0],
            BlockOutcome::Unchanged { reason: DecodeError::Misaligned(10), .. }
        ));
    }

    #[test]
    fn inconsistent_padding_is_kept() {
        assert_eq!(unpad(&[b'a', b'b', 2, 2]), b"ab");
        assert_eq!(unpad(&[b'a', 1, 3]), &[b'a', 1, 3]);
        assert_eq!(unpad(&[b'a', b'b', 0, 0]), b"ab");
        assert_eq!(unpad(&[]), b"");
    }

    #[test]
    fn wrong_key_does_not_panic() {
        let cipher = hex::encode(encrypt("secret", "12345"));
        let body = format!("{BEGIN}{cipher}{END}");
        let out = decrypt(&body, "99999");
        assert!(out.starts_with(PLAIN_BEGIN));
    }

    #[test]
    fn escaped_surrogates_are_removed() {
        assert_eq!(strip_escaped_surrogates(r"hi \ud83d\ude00!"), r"hi \ude00!");
    }
}
