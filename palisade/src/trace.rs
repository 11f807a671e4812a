//! Packet traces for offline replay.
//!
//! One packet per line: `[t=<secs>] <pre|out> <in-iface|-> <out-iface|-> <hex>`.
//! Blank lines and `#` comments are ignored; whitespace inside the hex is
//! allowed.

use palisade_core::{HookPoint, Timestamp};
use thiserror::Error;
use utils::{HexError, hex_to_bytes};

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid timestamp {0:?}")]
    Timestamp(String),

    #[error("unknown hook {0:?} (expected pre or out)")]
    Hook(String),

    #[error(transparent)]
    Hex(#[from] HexError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub at: Option<Timestamp>,
    pub hook: HookPoint,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub packet: Vec<u8>,
}

pub fn parse_hook(token: &str) -> Result<HookPoint, TraceError> {
    match token.to_ascii_lowercase().as_str() {
        "pre" | "pre-routing" | "prerouting" => Ok(HookPoint::PreRouting),
        "out" | "local-out" | "localout" => Ok(HookPoint::LocalOut),
        _ => Err(TraceError::Hook(token.to_string())),
    }
}

pub fn hook_label(hook: HookPoint) -> &'static str {
    match hook {
        HookPoint::PreRouting => "pre",
        HookPoint::LocalOut => "out",
    }
}

pub fn parse_line(line: &str) -> Result<Option<TraceRecord>, TraceError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (at, rest) = match line.strip_prefix("t=") {
        Some(rest) => {
            let (secs, rest) = next_token(rest).ok_or(TraceError::Missing("timestamp"))?;
            let secs = secs
                .parse::<Timestamp>()
                .map_err(|_| TraceError::Timestamp(secs.to_string()))?;
            (Some(secs), rest)
        }
        None => (None, line),
    };
    let (hook, rest) = next_token(rest).ok_or(TraceError::Missing("hook"))?;
    let (in_iface, rest) = next_token(rest).ok_or(TraceError::Missing("input interface"))?;
    let (out_iface, rest) = next_token(rest).ok_or(TraceError::Missing("output interface"))?;
    let packet = hex_to_bytes(rest)?;
    if packet.is_empty() {
        return Err(TraceError::Missing("packet bytes"));
    }

    Ok(Some(TraceRecord {
        at,
        hook: parse_hook(hook)?,
        in_iface: iface(in_iface),
        out_iface: iface(out_iface),
        packet,
    }))
}

fn iface(token: &str) -> Option<String> {
    (token != "-").then(|| token.to_string())
}

fn next_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    Some(input.split_once(char::is_whitespace).unwrap_or((input, "")))
}
