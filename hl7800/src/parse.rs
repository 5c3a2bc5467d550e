//! Field level helpers for AT response lines.

use core::{cmp::Ordering, str::FromStr};

/// Splits the remainder of a response line at commas.
pub fn fields(rest: &[u8]) -> impl Iterator<Item = &[u8]> {
    rest.split(|b| *b == b',')
}

/// Strips surrounding whitespace.
pub fn trim(field: &[u8]) -> &[u8] {
    field.trim_ascii()
}

/// Strips surrounding whitespace and double quotes.
pub fn unquote(field: &[u8]) -> &[u8] {
    let field = trim(field);
    match field {
        [b'"', inner @ .., b'"'] => inner,
        _ => field,
    }
}

/// Parse a numeric field.
pub fn number<T: FromStr>(field: &[u8]) -> Option<T> {
    core::str::from_utf8(trim(field)).ok()?.parse().ok()
}

/// Parse the n-th field of a comma separated list as a number.
pub fn nth_number<T: FromStr>(rest: &[u8], index: usize) -> Option<T> {
    number(fields(rest).nth(index)?)
}

/// Copy a field into a bounded string, truncating it at capacity.
pub fn to_string<const N: usize>(field: &[u8]) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for c in field.iter().copied().filter(u8::is_ascii) {
        if out.push(c as char).is_err() {
            break;
        }
    }
    out
}

/// Compare two firmware revision strings like `HL7800.4.5.4.0`.
///
/// Everything up to the first dot is a product prefix and isn't compared. The remaining
/// components are compared numerically, left to right. A missing component counts as zero.
pub fn compare_revisions(a: &str, b: &str) -> Ordering {
    fn components(revision: &str) -> impl Iterator<Item = u32> + '_ {
        revision
            .split('.')
            .skip(1)
            .map(|part| {
                part.bytes()
                    .take_while(u8::is_ascii_digit)
                    .fold(0u32, |acc, d| {
                        acc.saturating_mul(10).saturating_add((d - b'0') as u32)
                    })
            })
    }
    let mut left = components(a);
    let mut right = components(b);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => match l.unwrap_or(0).cmp(&r.unwrap_or(0)) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}
