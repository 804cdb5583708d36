// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Best-effort recovery of sender / code / message from pre-formatted chat lines.
//!
//! Servers decorate names in wildly different ways (`[gray]abc`, `Name|abc`, `Name abcX`, ...).
//! Nothing here is authoritative: every function returns `Option` and callers treat a `None` as
//! "no evidence", never as an error.

use crate::ids::{StableCode, safe_message, strip_colors};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    static ref GRAY_CODE: Regex =
        Regex::new(r"(?i)\[(?:gr(?:a|e)y)\]\s*([A-Za-z0-9]{3,16})").expect("static regex");
    static ref ALNUM_RUN: Regex = Regex::new(r"[A-Za-z0-9]+").expect("static regex");
    static ref NAME_TAIL_CODE: Regex =
        Regex::new(r"(?:\||\s)([A-Za-z0-9]{3,16})(?:[^A-Za-z0-9]*)$").expect("static regex");
}

/// Longest alphanumeric run considered as a code candidate.
const MAX_TOKEN_RUN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedChatLine {
    pub sender: String,
    pub code: Option<String>,
    pub message: String,
}

/// Parse a raw (possibly colourised) chat line of the shape `<head>: <body>`.
///
/// When `plain_name` is non-empty the line must mention it, which lets callers scanning recent
/// chat history skip lines from other players.
pub fn parse_raw_chat_line(raw: &str, plain_name: &str) -> Option<ParsedChatLine> {
    let stripped = strip_colors(raw);
    let colon = stripped.find(':')?;

    let head = stripped[..colon].trim();
    let body = safe_message(&stripped[colon + 1..]);
    if body.is_empty() {
        return None;
    }

    if !plain_name.is_empty() && !head.contains(plain_name) && !stripped.contains(plain_name) {
        return None;
    }

    let code = code_from_line(raw, &stripped, plain_name);
    let mut sender = normalize_sender_head(head, code.as_ref());
    if sender.is_empty() {
        sender = plain_name.to_string();
    }

    Some(ParsedChatLine {
        sender,
        code: code.map(StableCode::into_string),
        message: body,
    })
}

/// A code appended to a display name, e.g. `Alice|x7Q` or `Alice x7QX`.
pub fn code_from_display_name(raw_name: &str) -> Option<StableCode> {
    let stripped = strip_colors(raw_name);
    let stripped = stripped.trim();
    if stripped.is_empty() {
        return None;
    }
    NAME_TAIL_CODE
        .captures(stripped)
        .and_then(|caps| caps.get(1))
        .and_then(|m| code_from_token(m.as_str()))
}

fn code_from_line(raw: &str, stripped: &str, plain_name: &str) -> Option<StableCode> {
    let head = match stripped.find(':') {
        Some(colon) => &stripped[..colon],
        None => stripped,
    };

    if let Some(code) = code_after_name(head, plain_name) {
        return Some(code);
    }
    if let Some(code) = code_from_display_name(head) {
        return Some(code);
    }

    let raw_head = match raw.find(':') {
        Some(colon) => &raw[..colon],
        None => raw,
    };
    if let Some(code) = GRAY_CODE
        .captures_iter(raw_head)
        .filter_map(|caps| caps.get(1))
        .find_map(|m| code_from_token(m.as_str()))
    {
        return Some(code);
    }

    let after_pipe = match head.rfind('|') {
        Some(pipe) if pipe + 1 < head.len() => head[pipe + 1..].trim(),
        _ => head.trim(),
    };
    first_code_token(after_pipe)
}

fn code_after_name(head: &str, plain_name: &str) -> Option<StableCode> {
    if plain_name.is_empty() {
        return None;
    }
    let index = head.find(plain_name)?;
    first_code_token(&head[index + plain_name.len()..])
}

/// Scan alphanumeric runs that start on a word boundary; each run contributes at most its first
/// sixteen characters as a candidate.
fn first_code_token(text: &str) -> Option<StableCode> {
    ALNUM_RUN
        .find_iter(text)
        .filter(|m| m.as_str().len() >= 3)
        .find_map(|m| {
            let run = m.as_str();
            code_from_token(&run[..run.len().min(MAX_TOKEN_RUN)])
        })
}

/// A candidate token is a code when it is exactly three alphanumerics, or three alphanumerics
/// followed by an `X` marker.
fn code_from_token(token: &str) -> Option<StableCode> {
    let prefix: String = token
        .trim()
        .chars()
        .take_while(char::is_ascii_alphanumeric)
        .take(8)
        .collect();

    match prefix.len() {
        0..=2 => None,
        3 => StableCode::parse(&prefix).ok(),
        _ if prefix[3..].starts_with(['X', 'x']) => StableCode::parse(&prefix[..3]).ok(),
        _ => None,
    }
}

fn normalize_sender_head(head: &str, code: Option<&StableCode>) -> String {
    let mut out = head.trim();
    loop {
        let before = out;
        out = out.strip_prefix('[').map(str::trim).unwrap_or(out);
        out = out.strip_suffix(']').map(str::trim).unwrap_or(out);
        if out == before {
            break;
        }
    }

    let Some(code) = code else {
        return out.to_string();
    };
    let pattern = format!(
        r"(?i)(?:\||\s)+{}(?:[Xx])?[^A-Za-z0-9]*$",
        regex::escape(code.as_str())
    );
    match Regex::new(&pattern) {
        Ok(re) => re.replace(out, "").trim().to_string(),
        Err(_) => out.to_string(),
    }
}
