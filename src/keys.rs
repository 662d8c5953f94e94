//! Routing key and identity derivation.
//!
//! Pure functions that turn pub/sub topics, public keys and name-record
//! identities into the keys the peer network uses for provider lookups.
//! Output must match the network byte for byte, so every constant here is
//! part of the wire format.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

/// Namespace the pub/sub layer prepends before hashing a topic.
const TOPIC_NAMESPACE: &str = "floodsub:";
/// Topic prefix for name records republished over pub/sub.
const RECORD_TOPIC_PREFIX: &str = "/record/";
const NAME_NAMESPACE: &[u8] = b"/ipns/";

/// Protobuf framing of an ed25519 public key (key type 1, 32 data bytes).
const PUBLIC_KEY_PREFIX: [u8; 4] = [8, 1, 18, 32];
const PUBLIC_KEY_LEN: usize = 32;

const CID_VERSION: u64 = 1;
const CODEC_RAW: u64 = 0x55;
const CODEC_LIBP2P_KEY: u64 = 0x72;
const MULTIHASH_IDENTITY: u64 = 0x00;
const MULTIHASH_SHA2_256: u64 = 0x12;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Standard base64 that accepts keys with or without trailing padding.
const BASE64_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Key derivation error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid public key length: expected {expected} bytes, got {got}")]
    PublicKeyLength { expected: usize, got: usize },
    #[error("invalid base64 public key: {0}")]
    Base64(String),
    #[error("unparseable identity '{identity}': {reason}")]
    Identity { identity: String, reason: String },
}

/// Derive the routing key under which peers announce a pub/sub topic.
///
/// The topic is namespaced, hashed with sha2-256 and wrapped as a CIDv1 with
/// the raw codec, rendered in lowercase base32 multibase.
pub fn topic_to_routing_key(topic: &str) -> String {
    string_to_cid(&format!("{}{}", TOPIC_NAMESPACE, topic))
}

/// CIDv1 (raw, sha2-256, base32) of an arbitrary string.
pub fn string_to_cid(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    encode_cid(CODEC_RAW, MULTIHASH_SHA2_256, &digest)
}

/// Build the pub/sub topic a name record for `identity` is republished on.
pub fn identity_to_routing_topic(identity: &str) -> Result<String, KeyError> {
    let identity_bytes = parse_identity(identity)?;
    let mut namespaced = Vec::with_capacity(NAME_NAMESPACE.len() + identity_bytes.len());
    namespaced.extend_from_slice(NAME_NAMESPACE);
    namespaced.extend_from_slice(&identity_bytes);
    Ok(format!("{}{}", RECORD_TOPIC_PREFIX, URL_SAFE_NO_PAD.encode(namespaced)))
}

/// Routing key for the name record of `identity`.
pub fn routing_key_for_name(identity: &str) -> Result<String, KeyError> {
    Ok(topic_to_routing_key(&identity_to_routing_topic(identity)?))
}

/// Canonical address for a raw 32-byte public key.
pub fn public_key_to_address(public_key: &[u8]) -> Result<String, KeyError> {
    let key: &[u8; PUBLIC_KEY_LEN] = public_key.try_into().map_err(|_| KeyError::PublicKeyLength {
        expected: PUBLIC_KEY_LEN,
        got: public_key.len(),
    })?;
    Ok(address_from_key(key))
}

/// Canonical address for a base64-encoded public key.
pub fn public_key_b64_to_address(public_key_b64: &str) -> Result<String, KeyError> {
    public_key_to_address(&decode_public_key(public_key_b64)?)
}

/// Decode a base64 public key, padded or not.
pub fn decode_public_key(public_key_b64: &str) -> Result<Vec<u8>, KeyError> {
    BASE64_LENIENT
        .decode(public_key_b64.trim())
        .map_err(|e| KeyError::Base64(e.to_string()))
}

/// Address of a freshly generated random key, used for throwaway topics and
/// synthetic provider records.
pub fn random_identity() -> String {
    let key: [u8; PUBLIC_KEY_LEN] = rand::random();
    address_from_key(&key)
}

fn address_from_key(key: &[u8; PUBLIC_KEY_LEN]) -> String {
    let mut framed = Vec::with_capacity(PUBLIC_KEY_PREFIX.len() + PUBLIC_KEY_LEN);
    framed.extend_from_slice(&PUBLIC_KEY_PREFIX);
    framed.extend_from_slice(key);
    bs58::encode(encode_multihash(MULTIHASH_IDENTITY, &framed)).into_string()
}

/// Parse an identity string into its multihash bytes.
///
/// Accepts base58btc peer identities (`12D…`, `Qm…`) and CIDv1 `libp2p-key`
/// encodings in base36 (`k…`) or base32 (`b…`).
pub fn parse_identity(identity: &str) -> Result<Vec<u8>, KeyError> {
    let fail = |reason: &str| KeyError::Identity {
        identity: identity.to_string(),
        reason: reason.to_string(),
    };

    let multihash = if identity.starts_with('1') || identity.starts_with("Qm") {
        bs58::decode(identity).into_vec().map_err(|e| fail(&e.to_string()))?
    } else if let Some(rest) = identity.strip_prefix('k') {
        let cid = decode_base_n(&rest.to_ascii_lowercase(), BASE36_ALPHABET)
            .ok_or_else(|| fail("invalid base36"))?;
        cid_multihash(&cid).map_err(|reason| fail(&reason))?
    } else if let Some(rest) = identity.strip_prefix('b') {
        let cid = base32_decode(rest).ok_or_else(|| fail("invalid base32"))?;
        cid_multihash(&cid).map_err(|reason| fail(&reason))?
    } else {
        return Err(fail("unknown encoding"));
    };

    validate_multihash(&multihash).map_err(|reason| fail(&reason))?;
    Ok(multihash)
}

/// Whether `value` is a syntactically valid identity.
pub fn is_identity(value: &str) -> bool {
    parse_identity(value).is_ok()
}

fn encode_cid(codec: u64, hash_code: u64, digest: &[u8]) -> String {
    let mut buf = varint_encode::u64_buffer();
    let mut bytes = Vec::with_capacity(digest.len() + 8);
    bytes.extend_from_slice(varint_encode::u64(CID_VERSION, &mut buf));
    bytes.extend_from_slice(varint_encode::u64(codec, &mut buf));
    bytes.extend_from_slice(&encode_multihash(hash_code, digest));
    format!("b{}", base32_lower(&bytes))
}

fn encode_multihash(code: u64, digest: &[u8]) -> Vec<u8> {
    let mut buf = varint_encode::u64_buffer();
    let mut bytes = Vec::with_capacity(digest.len() + 4);
    bytes.extend_from_slice(varint_encode::u64(code, &mut buf));
    bytes.extend_from_slice(varint_encode::u64(digest.len() as u64, &mut buf));
    bytes.extend_from_slice(digest);
    bytes
}

fn cid_multihash(cid: &[u8]) -> Result<Vec<u8>, String> {
    let (version, rest) = varint_decode::u64(cid).map_err(|e| e.to_string())?;
    if version != CID_VERSION {
        return Err(format!("unsupported cid version {}", version));
    }
    let (codec, rest) = varint_decode::u64(rest).map_err(|e| e.to_string())?;
    if codec != CODEC_LIBP2P_KEY {
        return Err(format!("unexpected codec 0x{:x}", codec));
    }
    Ok(rest.to_vec())
}

fn validate_multihash(bytes: &[u8]) -> Result<(), String> {
    let (code, rest) = varint_decode::u64(bytes).map_err(|e| e.to_string())?;
    if code != MULTIHASH_IDENTITY && code != MULTIHASH_SHA2_256 {
        return Err(format!("unsupported multihash code 0x{:x}", code));
    }
    let (len, digest) = varint_decode::u64(rest).map_err(|e| e.to_string())?;
    if digest.len() as u64 != len {
        return Err(format!("multihash length {} does not match {} digest bytes", len, digest.len()));
    }
    Ok(())
}

fn base32_lower(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in data {
        buffer = ((buffer << 8) | byte as u32) & 0xffff;
        bits += 8;
        while bits >= 5 {
            out.push(BASE32_ALPHABET[((buffer >> (bits - 5)) & 31) as usize] as char);
            bits -= 5;
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 31) as usize] as char);
    }
    out
}

fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in input.bytes() {
        let value = BASE32_ALPHABET.iter().position(|&a| a == c.to_ascii_lowercase())? as u32;
        buffer = ((buffer << 5) | value) & 0xffff;
        bits += 5;
        if bits >= 8 {
            out.push((buffer >> (bits - 8)) as u8);
            bits -= 8;
        }
    }
    Some(out)
}

/// Big-number decode for alphabets that are not a power of two.
fn decode_base_n(input: &str, alphabet: &[u8]) -> Option<Vec<u8>> {
    let base = alphabet.len() as u32;
    // little-endian accumulator
    let mut bytes: Vec<u8> = Vec::new();
    for c in input.bytes() {
        let mut carry = alphabet.iter().position(|&a| a == c)? as u32;
        for b in bytes.iter_mut() {
            carry += (*b as u32) * base;
            *b = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let leading_zeros = input.bytes().take_while(|&c| c == alphabet[0]).count();
    bytes.extend(std::iter::repeat(0).take(leading_zeros));
    bytes.reverse();
    Some(bytes)
}
