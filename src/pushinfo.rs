//! Parser for the IPC scratch files custom hooks leave behind:
//! `pushinfo.log` (ref update records) and `log.trace` (an strace-style
//! transcript of the git backend).
//!
//! Emits one structured JSON record per session for post-hooks to consume.
//! When `log.trace` is missing, a record is still conjured from
//! `pushinfo.log` alone; such records carry `"synthetic": true` so
//! downstream consumers can discount them. Everything here fails soft: a
//! missing or garbled input degrades to a debug dump and an empty record,
//! never a failed hook.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefUpdate {
    pub old: Option<String>,
    pub new: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushInfoRecord {
    /// True when no real trace was available and the wire-level fields
    /// were reconstructed from the ref records alone.
    pub synthetic: bool,
    pub refs: Vec<RefUpdate>,
    pub wants: Vec<String>,
    pub haves: Vec<String>,
    pub agents: Vec<String>,
    pub backend: Option<String>,
    pub exit_status: Option<i32>,
}

/// CLI entry: read the IPC directory and print the record as JSON.
pub fn run(ipc_override: Option<PathBuf>) -> Result<()> {
    let ipc = ipc_override
        .or_else(|| env::var("IPC").ok().map(PathBuf::from))
        .context("No IPC directory; set IPC or pass --ipc")?;
    let record = collect(&ipc);
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

/// Builds the session record from whatever the IPC directory holds.
pub fn collect(ipc: &Path) -> PushInfoRecord {
    let refs = match fs::read_to_string(ipc.join("pushinfo.log")) {
        Ok(content) => parse_pushinfo(&content),
        Err(err) => {
            debug!("no pushinfo.log in {}: {err}", ipc.display());
            Vec::new()
        }
    };

    match fs::read_to_string(ipc.join("log.trace")) {
        Ok(content) => {
            let trace = parse_trace(&content);
            let mut record = PushInfoRecord {
                synthetic: false,
                refs,
                backend: trace.backend,
                exit_status: trace.exit_status,
                ..Default::default()
            };
            for payload in pkt_payloads(&trace.client_to_server)
                .into_iter()
                .chain(pkt_payloads(&trace.server_to_client))
            {
                scan_payload(&payload, &mut record);
            }
            record
        }
        Err(err) => {
            debug!("no log.trace in {}: {err}", ipc.display());
            synthesize(refs)
        }
    }
}

/// The approximation made when only ref records exist: the new tips are
/// what the client wanted, the previous tips are what it had.
fn synthesize(refs: Vec<RefUpdate>) -> PushInfoRecord {
    const ZERO: &str = "0000000000000000000000000000000000000000";
    let wants = refs
        .iter()
        .filter_map(|r| r.new.clone())
        .filter(|oid| oid != ZERO)
        .collect();
    let haves = refs
        .iter()
        .filter_map(|r| r.old.clone())
        .filter(|oid| oid != ZERO)
        .collect();
    PushInfoRecord {
        synthetic: true,
        refs,
        wants,
        haves,
        ..Default::default()
    }
}

/// `pushinfo.log`: indented ref records separated by blank lines. A record
/// line is either a post-receive style triple (`old new refname`) or a
/// `key: value` pair using `old`/`new`/`ref`.
pub fn parse_pushinfo(content: &str) -> Vec<RefUpdate> {
    let mut refs = Vec::new();
    for stanza in content.split("\n\n") {
        let mut update = RefUpdate::default();
        for line in stanza.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() >= 3 && tokens[2].starts_with("refs/") {
                update.old = Some(tokens[0].to_string());
                update.new = Some(tokens[1].to_string());
                update.name = Some(tokens[2].to_string());
                continue;
            }
            if let Some((key, value)) = line.split_once(':').or_else(|| line.split_once('=')) {
                let value = value.trim().to_string();
                match key.trim() {
                    "old" => update.old = Some(value),
                    "new" => update.new = Some(value),
                    "ref" | "refname" => update.name = Some(value),
                    _ => {}
                }
            }
        }
        if update != RefUpdate::default() {
            refs.push(update);
        }
    }
    refs
}

#[derive(Debug, Default)]
struct TraceStreams {
    client_to_server: Vec<u8>,
    server_to_client: Vec<u8>,
    backend: Option<String>,
    exit_status: Option<i32>,
}

/// Reconstructs the approximate byte streams from an strace-style
/// transcript: `read(0, …)` is client→server, `write(1, …)` is
/// server→client.
fn parse_trace(content: &str) -> TraceStreams {
    let read_re = Regex::new(r#"^read\(0,\s*"((?:[^"\\]|\\.)*)""#).unwrap();
    let write_re = Regex::new(r#"^write\((1|2),\s*"((?:[^"\\]|\\.)*)""#).unwrap();
    let execve_re = Regex::new(r#"^execve\("([^"]+)""#).unwrap();
    let exit_re = Regex::new(r"\+\+\+ exited with (\d+) \+\+\+").unwrap();

    let mut streams = TraceStreams::default();
    for line in content.lines() {
        if let Some(caps) = read_re.captures(line) {
            streams.client_to_server.extend(unescape(&caps[1]));
        } else if let Some(caps) = write_re.captures(line) {
            if &caps[1] == "1" {
                streams.server_to_client.extend(unescape(&caps[2]));
            }
        } else if let Some(caps) = execve_re.captures(line) {
            streams.backend.get_or_insert_with(|| caps[1].to_string());
        } else if let Some(caps) = exit_re.captures(line) {
            streams.exit_status = caps[1].parse().ok();
        }
    }
    streams
}

/// Undoes strace's C-style string escaping (`\n`, `\t`, `\"`, `\\`,
/// `\xHH`, octal `\NNN`).
fn unescape(escaped: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(escaped.len());
    let mut chars = escaped.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => bytes.push(b'\n'),
            Some('t') => bytes.push(b'\t'),
            Some('r') => bytes.push(b'\r'),
            Some(digit @ '0'..='7') => {
                // Octal escape, up to three digits total.
                let mut value = digit.to_digit(8).unwrap();
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(v) => {
                            value = value * 8 + v;
                            chars.next();
                        }
                        None => break,
                    }
                }
                bytes.push(value as u8);
            }
            Some('x') => {
                let mut value: u8 = 0;
                let mut seen = false;
                while let Some(&d) = chars.peek() {
                    if let Some(v) = d.to_digit(16) {
                        value = value.wrapping_mul(16).wrapping_add(v as u8);
                        chars.next();
                        seen = true;
                    } else {
                        break;
                    }
                }
                if seen {
                    bytes.push(value);
                }
            }
            Some(other) => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => {}
        }
    }
    bytes
}

/// Strips pkt-line framing: packets start with a four-hex-digit length
/// covering the header itself; `0000`-`0004` are flush/delimiter packets
/// with no payload. Returns the decoded payload lines; an unframed stream
/// yields nothing and the caller keeps the raw text.
fn pkt_payloads(stream: &[u8]) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut i = 0;
    while i + 4 <= stream.len() {
        let header = &stream[i..i + 4];
        if !header.iter().all(u8::is_ascii_hexdigit) {
            break;
        }
        let len = match usize::from_str_radix(&String::from_utf8_lossy(header), 16) {
            Ok(len) => len,
            Err(_) => break,
        };
        if len <= 4 {
            i += 4;
            continue;
        }
        let end = (i + len).min(stream.len());
        let payload = String::from_utf8_lossy(&stream[i + 4..end]);
        payloads.push(payload.trim_end_matches('\n').to_string());
        i = end;
    }
    payloads
}

/// Pulls `want`/`have` object ids and `agent=` capability tokens out of a
/// decoded pkt-line payload.
fn scan_payload(payload: &str, record: &mut PushInfoRecord) {
    // Capabilities ride behind a NUL on the first want/have line.
    for part in payload.split('\0') {
        let mut tokens = part.split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            match token {
                "want" => {
                    if let Some(oid) = tokens.peek().filter(|t| is_oid(t)) {
                        record.wants.push(oid.to_string());
                        tokens.next();
                    }
                }
                "have" => {
                    if let Some(oid) = tokens.peek().filter(|t| is_oid(t)) {
                        record.haves.push(oid.to_string());
                        tokens.next();
                    }
                }
                _ => {
                    if let Some(agent) = token.strip_prefix("agent=") {
                        record.agents.push(agent.to_string());
                    }
                }
            }
        }
    }
}

fn is_oid(token: &str) -> bool {
    token.len() >= 40 && token.chars().all(|c| c.is_ascii_hexdigit())
}
