//! Transport obfuscation
//!
//! Frames are scrambled before they reach the socket: a fixed salt is spliced
//! into the plaintext at a random position, the result is run through Blowfish
//! in CFB mode and then raw-deflated. Decoding reverses the pipeline and
//! rejects payloads that do not carry the salt.
//!
//! This is not a confidentiality boundary. The key is derived from the public
//! protocol version and the IV is all zeroes; it only keeps casual traffic
//! off the wire and filters out peers that do not speak the protocol.

use std::io::{Read, Write};

use blowfish::Blowfish;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rand::Rng;

use crate::config::NeuronConfig;
use crate::errors::{CodecError, Result};

type Encryptor = cfb_mode::Encryptor<Blowfish>;
type Decryptor = cfb_mode::Decryptor<Blowfish>;

/// Marker spliced into every plaintext
pub const SALT: &[u8] = b".Salt.";

const KEY_PREFIX: &str = "ExampleKey";
const IV: [u8; 8] = [0u8; 8];

/// Derive the cipher key from a dotted version string
///
/// `"1.4.7"` yields `ExampleKey147`.
pub fn derive_key(version: &str) -> Vec<u8> {
    let mut key = String::from(KEY_PREFIX);
    key.extend(version.split('.'));
    key.into_bytes()
}

/// Salted Blowfish-CFB plus deflate pipeline bound to one key
#[derive(Debug, Clone)]
pub struct Obfuscator {
    key: Vec<u8>,
}

impl Obfuscator {
    pub fn new(version: &str) -> Self {
        Self {
            key: derive_key(version),
        }
    }

    pub fn from_config(config: &NeuronConfig) -> Self {
        Self::new(&config.version)
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Salt, encrypt and compress a plaintext
    ///
    /// The salt lands at or before the first `.` of the plaintext, so it is
    /// always the first salt occurrence in the spliced buffer.
    pub fn encode(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let limit = plain.iter().position(|b| *b == b'.').unwrap_or(plain.len());
        let split = rand::thread_rng().gen_range(0..=limit);

        let mut buf = Vec::with_capacity(plain.len() + SALT.len());
        buf.extend_from_slice(&plain[..split]);
        buf.extend_from_slice(SALT);
        buf.extend_from_slice(&plain[split..]);

        self.encryptor()?.encrypt(&mut buf);

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&buf).map_err(CodecError::from)?;
        Ok(encoder.finish().map_err(CodecError::from)?)
    }

    /// Decompress, decrypt and strip the salt
    ///
    /// Returns `Ok(None)` when the decrypted payload carries no salt.
    pub fn decode(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        DeflateDecoder::new(data)
            .read_to_end(&mut buf)
            .map_err(CodecError::from)?;

        self.decryptor()?.decrypt(&mut buf);

        let Some(index) = find(&buf, SALT) else {
            return Ok(None);
        };
        buf.drain(index..index + SALT.len());
        Ok(Some(buf))
    }

    /// Encode a text frame
    pub fn encode_str(&self, frame: &str) -> Result<Vec<u8>> {
        self.encode(frame.as_bytes())
    }

    /// Decode into text, treating non-UTF-8 output as a codec error
    pub fn decode_str(&self, data: &[u8]) -> Result<Option<String>> {
        match self.decode(data)? {
            Some(plain) => Ok(Some(
                String::from_utf8(plain).map_err(|e| CodecError::from(e.utf8_error()))?,
            )),
            None => Ok(None),
        }
    }

    fn encryptor(&self) -> Result<Encryptor> {
        Encryptor::new_from_slices(&self.key, &IV).map_err(|e| {
            CodecError::Cipher {
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn decryptor(&self) -> Result<Decryptor> {
        Decryptor::new_from_slices(&self.key, &IV).map_err(|e| {
            CodecError::Cipher {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation() {
        assert_eq!(derive_key("1.4.7"), b"ExampleKey147".to_vec());
        assert_eq!(derive_key("2"), b"ExampleKey2".to_vec());
    }

    #[test]
    fn test_round_trip_frame() {
        let obfuscator = Obfuscator::new("1.4.7");
        let frame = "Neuron#!HEART#**";
        let encoded = obfuscator.encode_str(frame).unwrap();
        assert_ne!(encoded, frame.as_bytes());
        assert_eq!(obfuscator.decode_str(&encoded).unwrap().as_deref(), Some(frame));
    }

    #[test]
    fn test_round_trip_payload_containing_salt() {
        let obfuscator = Obfuscator::new("1.4.7");
        let plain = b"a.Salt.b.Salt.c";
        for _ in 0..32 {
            let encoded = obfuscator.encode(plain).unwrap();
            assert_eq!(obfuscator.decode(&encoded).unwrap().unwrap(), plain.to_vec());
        }
    }

    #[test]
    fn test_empty_payload() {
        let obfuscator = Obfuscator::new("1.4.7");
        let encoded = obfuscator.encode(b"").unwrap();
        assert_eq!(obfuscator.decode(&encoded).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_missing_salt_yields_none() {
        let obfuscator = Obfuscator::new("1.4.7");
        let mut unsalted = b"no salt in here".to_vec();
        obfuscator.encryptor().unwrap().encrypt(&mut unsalted);
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&unsalted).unwrap();
        let data = encoder.finish().unwrap();
        assert_eq!(obfuscator.decode(&data).unwrap(), None);
    }

    #[test]
    fn test_wrong_version_does_not_decode() {
        let sender = Obfuscator::new("1.4.7");
        let receiver = Obfuscator::new("9.9.9");
        let encoded = sender.encode(b"?EVAL#System#Ping#**").unwrap();
        let decoded = receiver.decode(&encoded).unwrap();
        assert_ne!(decoded, Some(b"?EVAL#System#Ping#**".to_vec()));
    }

    #[test]
    fn test_garbage_is_an_error() {
        let obfuscator = Obfuscator::new("1.4.7");
        assert!(obfuscator.decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
