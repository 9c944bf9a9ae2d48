use blake3::Hasher;
use rand::{RngCore, rngs::OsRng};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Encodes raw bytes into hexadecimal representation.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        output.push(nibble(byte >> 4));
        output.push(nibble(byte & 0x0f));
    }
    output
}

/// Generates an opaque identifier from entropy and context.
pub fn generate_id(context: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(context.as_bytes());
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_le_bytes();
    hasher.update(&now);
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    hasher.update(&salt);
    encode_hex(&hasher.finalize().as_bytes()[..16])
}

/// Hex token of `len` bytes drawn from the OS RNG.
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    encode_hex(&bytes)
}

/// Shows only the first two characters of a secret.
pub fn mask_code(code: &str) -> String {
    let visible = code.chars().take(2).collect::<String>();
    let hidden = code.chars().count().saturating_sub(2);
    format!("{}{}", visible, "*".repeat(hidden))
}

/// Parses an `application/x-www-form-urlencoded` body.
pub fn parse_form(body: &[u8]) -> Result<HashMap<String, String>, &'static str> {
    let text = std::str::from_utf8(body).map_err(|_| "form body is not utf-8")?;
    let mut fields = HashMap::new();
    for pair in text.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        fields.insert(percent_decode(key)?, percent_decode(value)?);
    }
    Ok(fields)
}

/// Decodes `%XX` escapes and `+` as space.
pub fn percent_decode(input: &str) -> Result<String, &'static str> {
    let bytes = input.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                output.push(b' ');
                index += 1;
            }
            b'%' => {
                if index + 2 >= bytes.len() {
                    return Err("truncated percent escape");
                }
                let high = decode_hex_digit(bytes[index + 1])?;
                let low = decode_hex_digit(bytes[index + 2])?;
                output.push((high << 4) | low);
                index += 3;
            }
            other => {
                output.push(other);
                index += 1;
            }
        }
    }
    String::from_utf8(output).map_err(|_| "decoded value is not utf-8")
}

/// Extracts a cookie value from a `Cookie` request header.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

fn decode_hex_digit(digit: u8) -> Result<u8, &'static str> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(10 + digit - b'a'),
        b'A'..=b'F' => Ok(10 + digit - b'A'),
        _ => Err("invalid hex digit"),
    }
}

fn nibble(value: u8) -> char {
    match value {
        0..=9 => char::from(b'0' + value),
        10..=15 => char::from(b'a' + (value - 10)),
        _ => '0',
    }
}
