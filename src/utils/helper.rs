use std::collections::HashSet;
use std::sync::PoisonError;

use tracing::warn;

use crate::error::{Result, TrackerError};
use crate::models::{Address, Amount, TrackedAccount};

/// Parse an address from string, with better error messages
pub fn parse_address(s: &str) -> Result<Address> {
    Address::parse(s)
}

/// Characters that would split or truncate an entry if left in a label
const LABEL_RESERVED: &[char] = &['%', ',', '&', ':', '\n', '\r'];

fn escape_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        if LABEL_RESERVED.contains(&c) {
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

fn unescape_label(raw: &str) -> Result<String> {
    let invalid = || TrackerError::Config(format!("malformed label escape: {}", raw));
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let code = rest.get(at + 1..at + 3).ok_or_else(invalid)?;
        let byte = u8::from_str_radix(code, 16).map_err(|_| invalid())?;
        out.push(char::from(byte));
        rest = &rest[at + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Parse one shareable list entry: `hexAddressWithout0x[:label]`.
///
/// A leading `0x` and an `a=` parameter prefix are tolerated. Labels may
/// carry `%XX` escapes for the list separators.
pub fn parse_tracked_entry(entry: &str) -> Result<TrackedAccount> {
    let entry = entry.trim();
    let entry = entry.strip_prefix("a=").unwrap_or(entry);
    let (address, label) = match entry.split_once(':') {
        Some((address, label)) => (address, Some(unescape_label(label.trim())?)),
        None => (entry, None),
    };

    Ok(TrackedAccount::new(Address::parse(address.trim())?, label))
}

/// Encode an account back into the shareable entry format
pub fn encode_tracked_entry(account: &TrackedAccount) -> String {
    match &account.label {
        Some(label) => format!("{}:{}", account.address.to_hex_without_prefix(), escape_label(label)),
        None => account.address.to_hex_without_prefix(),
    }
}

/// Join accounts into a shareable `&`-separated list
pub fn encode_tracked_list(accounts: &[TrackedAccount]) -> String {
    accounts
        .iter()
        .map(encode_tracked_entry)
        .collect::<Vec<_>>()
        .join("&")
}

/// Parse a list of entries separated by `,`, `&` or line breaks.
///
/// Spaces stay inside an entry so labels like `Main wallet` survive.
/// Stops at the first malformed entry so nothing invalid is ever tracked.
pub fn parse_tracked_list(list: &str) -> Result<Vec<TrackedAccount>> {
    list.split(|c: char| matches!(c, ',' | '&' | '\n' | '\r'))
        .filter(|entry| !entry.trim().is_empty())
        .map(parse_tracked_entry)
        .collect()
}

/// Pull every `0x` + 40 hex run out of free text, de-duplicated ignoring case
pub fn extract_addresses(text: &str) -> Vec<Address> {
    let bytes = text.as_bytes();
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    let mut i = 0;

    while i + 42 <= bytes.len() {
        let is_prefix = bytes[i] == b'0' && (bytes[i + 1] == b'x' || bytes[i + 1] == b'X');
        if is_prefix && bytes[i + 2..i + 42].iter().all(|b| b.is_ascii_hexdigit()) {
            if let Ok(address) = Address::parse(&text[i..i + 42]) {
                if seen.insert(address) {
                    found.push(address);
                }
            }
            i += 42;
        } else {
            i += 1;
        }
    }

    found
}

/// Render a fixed-point amount with `decimals` fractional digits
pub fn format_units(amount: Amount, decimals: u8) -> String {
    let scale = Amount::from(10u64).pow(Amount::from(decimals));
    let whole = amount / scale;
    let fraction = amount % scale;

    if decimals == 0 {
        return whole.to_string();
    }

    let fraction = format!("{:0>width$}", fraction.to_string(), width = decimals as usize);
    let trimmed = fraction.trim_end_matches('0');
    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };
    format!("{}.{}", whole, trimmed)
}

/// Parse a decimal token amount such as `"1.5"` into fixed point
pub fn parse_units(value: &str, decimals: u8) -> Result<Amount> {
    let invalid = || TrackerError::Config(format!("invalid amount: {}", value));
    let value = value.trim();
    let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));

    if whole.is_empty() && fraction.is_empty()
        || fraction.len() > decimals as usize
        || !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    let digits = format!("{}{:0<width$}", whole, fraction, width = decimals as usize);
    Amount::from_str_radix(&digits, 10).map_err(|_| invalid())
}

/// Recover the guard of a lock whose previous holder panicked.
///
/// Use as `lock.write().unwrap_or_else(recover_poisoned("name"))`.
pub fn recover_poisoned<G>(lock: &'static str) -> impl FnOnce(PoisonError<G>) -> G {
    move |poisoned| {
        warn!("{} lock poisoned by a panicked holder, recovering", lock);
        poisoned.into_inner()
    }
}

/// Format an address for display (truncated)
pub fn truncate_address(address: &Address) -> String {
    let s = address.to_string();
    format!("{}…{}", &s[..6], &s[s.len() - 4..])
}
