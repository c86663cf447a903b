// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Field extraction from partially received JSON.
//!
//! The planner streams its tool-call arguments as one JSON object whose
//! `message` field is the user-visible chat text.  To show that text live,
//! the stream parser needs to pull a string field out of a buffer that may
//! end mid-value, mid-escape, or mid-surrogate-pair.  The helpers here never
//! fail on truncated input — they return what is decodable so far plus a
//! completeness flag.

/// Locate the string value of `key` inside a (possibly truncated) JSON
/// object and return `(raw_escaped_value, complete)`.
///
/// The scan walks characters from the opening quote of the value,
/// maintaining escape state, and stops at the closing quote or at the end of
/// the buffer.  `complete` is `true` only when the closing quote was seen.
/// Returns `None` when the key (or the opening quote of its value) has not
/// arrived yet, or when the value is not a string.
pub fn extract_string_field(buf: &str, key: &str) -> Option<(String, bool)> {
    let needle = format!("\"{key}\"");
    let key_pos = buf.find(&needle)?;
    let mut rest = buf[key_pos + needle.len()..].chars();

    // Skip whitespace, the colon, and more whitespace.
    let mut seen_colon = false;
    loop {
        match rest.next() {
            Some(c) if c.is_whitespace() => continue,
            Some(':') if !seen_colon => {
                seen_colon = true;
                continue;
            }
            Some('"') if seen_colon => break,
            // Non-string value (number, object, array, bool) or malformed.
            Some(_) => return None,
            None => return None,
        }
    }

    let mut raw = String::new();
    let mut escaped = false;
    for c in rest {
        if escaped {
            raw.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                raw.push(c);
                escaped = true;
            }
            '"' => return Some((raw, true)),
            _ => raw.push(c),
        }
    }
    Some((raw, false))
}

/// Extract the complete string elements of the array value of `key`.
///
/// Used for the plan's `reasoning: string[]` field.  Elements whose closing
/// quote has not arrived yet are omitted; the caller re-extracts on the next
/// fragment and picks up where it left off by element count.
pub fn extract_string_array_field(buf: &str, key: &str) -> Vec<String> {
    let needle = format!("\"{key}\"");
    let Some(key_pos) = buf.find(&needle) else {
        return Vec::new();
    };
    let mut chars = buf[key_pos + needle.len()..].chars().peekable();

    // Skip to the opening bracket.
    let mut seen_colon = false;
    loop {
        match chars.next() {
            Some(c) if c.is_whitespace() => continue,
            Some(':') if !seen_colon => {
                seen_colon = true;
                continue;
            }
            Some('[') if seen_colon => break,
            _ => return Vec::new(),
        }
    }

    let mut items = Vec::new();
    loop {
        // Skip whitespace and commas between elements.
        loop {
            match chars.peek() {
                Some(c) if c.is_whitespace() || *c == ',' => {
                    chars.next();
                }
                _ => break,
            }
        }
        match chars.next() {
            Some('"') => {}
            // `]`, end of buffer, or a non-string element all end the scan.
            _ => return items,
        }
        let mut raw = String::new();
        let mut escaped = false;
        let mut complete = false;
        for c in chars.by_ref() {
            if escaped {
                raw.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => {
                    raw.push(c);
                    escaped = true;
                }
                '"' => {
                    complete = true;
                    break;
                }
                _ => raw.push(c),
            }
        }
        if !complete {
            return items;
        }
        items.push(decode_json_escapes(&raw));
    }
}

/// Decode JSON escape sequences in `raw`, tolerating truncation.
///
/// A trailing escape that was cut off mid-sequence (a lone `\`, or `\uXX`
/// with fewer than four hex digits) is kept as literal text rather than
/// rejected.  Surrogate pairs are combined; a surrogate that is provably
/// unpaired decodes to the replacement character.
pub fn decode_json_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c != '\\' {
            out.push(c);
            i += 1;
            continue;
        }
        let Some(&esc) = chars.get(i + 1) else {
            // Truncated trailing escape — keep the backslash literally.
            out.push('\\');
            break;
        };
        match esc {
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            '/' => out.push('/'),
            'b' => out.push('\u{0008}'),
            'f' => out.push('\u{000C}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'u' => match decode_unicode_escape(&chars, i) {
                Some((ch, consumed)) => {
                    out.push(ch);
                    i += consumed;
                    continue;
                }
                None => {
                    // Incomplete \uXXXX (or surrogate pair) at the end —
                    // literal passthrough of whatever is left.
                    out.extend(&chars[i..]);
                    break;
                }
            },
            other => {
                // Not a valid JSON escape; pass both characters through.
                out.push('\\');
                out.push(other);
            }
        }
        i += 2;
    }
    out
}

/// Decode `\uXXXX` starting at `chars[start]` (the backslash).  Returns the
/// decoded char and the number of chars consumed, or `None` when the
/// sequence (or a surrogate pair it opens) may still be in flight.
fn decode_unicode_escape(chars: &[char], start: usize) -> Option<(char, usize)> {
    let hex: String = chars.get(start + 2..start + 6)?.iter().collect();
    let code = u32::from_str_radix(&hex, 16).ok()?;

    if (0xD800..0xDC00).contains(&code) {
        let rest = &chars[start + 6..];
        if rest.is_empty() || (rest.len() == 1 && rest[0] == '\\') {
            // The low half may still arrive.
            return None;
        }
        if rest[0] == '\\' && rest.get(1) == Some(&'u') {
            if rest.len() < 6 {
                // Partial low escape — keep waiting.
                return None;
            }
            let low_hex: String = rest[2..6].iter().collect();
            if let Ok(low) = u32::from_str_radix(&low_hex, 16) {
                if (0xDC00..0xE000).contains(&low) {
                    let combined = 0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00);
                    if let Some(ch) = char::from_u32(combined) {
                        return Some((ch, 12));
                    }
                }
            }
        }
        // Provably unpaired high surrogate.
        return Some(('\u{FFFD}', 6));
    }

    Some((char::from_u32(code).unwrap_or('\u{FFFD}'), 6))
}

/// Strip trailing incomplete escapes (dangling `\`, partial `\uXX`, or a
/// high-surrogate escape still waiting for its pair) from a raw value.
///
/// Emission paths use this so that the decoded text is a stable prefix of
/// every later decode of the same buffer.  Applied to a fixpoint because a
/// partial low-surrogate escape can expose the high escape in front of it.
pub fn trim_dangling_escape(raw: &str) -> &str {
    let mut current = raw;
    loop {
        let trimmed = trim_once(current);
        if trimmed.len() == current.len() {
            return current;
        }
        current = trimmed;
    }
}

fn trim_once(raw: &str) -> &str {
    let chars: Vec<(usize, char)> = raw.char_indices().collect();
    if chars.is_empty() {
        return raw;
    }

    let escape_open = |idx: usize| -> bool {
        // A backslash opens an escape only when preceded by an even number
        // of backslashes.
        let mut preceding = 0;
        for j in (0..idx).rev() {
            if chars[j].1 == '\\' {
                preceding += 1;
            } else {
                break;
            }
        }
        preceding % 2 == 0
    };

    // Dangling single backslash.
    let last = chars.len() - 1;
    if chars[last].1 == '\\' && escape_open(last) {
        return &raw[..chars[last].0];
    }

    // Partial \u escape: `\u`, `\uX`, `\uXX`, `\uXXX` at the end.
    for len in 2..=5usize {
        if chars.len() < len {
            break;
        }
        let idx = chars.len() - len;
        if chars[idx].1 == '\\' && chars[idx + 1].1 == 'u' && escape_open(idx) {
            return &raw[..chars[idx].0];
        }
    }

    // Complete high-surrogate escape at the very end; its pair may follow.
    if chars.len() >= 6 {
        let idx = chars.len() - 6;
        if chars[idx].1 == '\\' && chars[idx + 1].1 == 'u' && escape_open(idx) {
            let hex: String = chars[idx + 2..idx + 6].iter().map(|&(_, c)| c).collect();
            if let Ok(code) = u32::from_str_radix(&hex, 16) {
                if (0xD800..0xDC00).contains(&code) {
                    return &raw[..chars[idx].0];
                }
            }
        }
    }

    raw
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
