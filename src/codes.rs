//! Random verification code generation.

const DIGITS: &[u8] = b"0123456789";
const ALPHANUMERIC: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn random_string(alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| char::from(alphabet[rand::random_range(0..alphabet.len())]))
        .collect()
}

/// Short code read out to the patient: `len` decimal digits.
#[must_use]
pub fn numeric(len: usize) -> String {
    random_string(DIGITS, len)
}

/// Long code delivered by link: `len` lowercase alphanumerics.
#[must_use]
pub fn alphanumeric(len: usize) -> String {
    random_string(ALPHANUMERIC, len)
}
