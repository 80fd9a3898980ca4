//! WireGuard-style configuration text parser
//!
//! Splits a document into the interface block and the peer blocks, and
//! tokenizes a block into `Key = Value` pairs. The format is deliberately
//! loose: comments (`#` or `;`) may start anywhere on a line, lines without
//! `=` are ignored and a repeated key overwrites the earlier one.

use std::collections::HashMap;

/// Header token that starts a peer block
pub const PEER_HEADER: &str = "[Peer]";

/// Upper bound on the number of blocks a document is split into
pub const MAX_BLOCKS: usize = 50;

/// Key/value pairs of one block
pub type Block = HashMap<String, String>;

/// Raw sections of a configuration document
#[derive(Debug, Clone)]
pub struct Sections<'a> {
    /// Everything before the first peer header
    pub interface: &'a str,
    /// One entry per peer header, in document order
    pub peers: Vec<&'a str>,
}

/// Split a document on its peer headers.
///
/// A header is a line whose first non-whitespace text is `[Peer]`. Text
/// following the header on the same line stays at the top of the new block.
pub fn split_sections(content: &str) -> Sections<'_> {
    let mut cuts: Vec<(usize, usize)> = Vec::new();
    let mut offset = 0;

    for line in content.split_inclusive('\n') {
        if cuts.len() + 1 >= MAX_BLOCKS {
            break;
        }
        let indent = line.len() - line.trim_start().len();
        if line[indent..].starts_with(PEER_HEADER) {
            cuts.push((offset, offset + indent + PEER_HEADER.len()));
        }
        offset += line.len();
    }

    let interface_end = cuts.first().map_or(content.len(), |&(start, _)| start);
    let peers = cuts
        .iter()
        .enumerate()
        .map(|(i, &(_, body_start))| {
            let body_end = cuts.get(i + 1).map_or(content.len(), |&(start, _)| start);
            &content[body_start..body_end]
        })
        .collect();

    Sections {
        interface: &content[..interface_end],
        peers,
    }
}

/// Tokenize a block into key/value pairs.
pub fn parse_block(block: &str) -> Block {
    let mut pairs = Block::new();

    for line in block.lines() {
        let line = strip_comment(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        pairs.insert(key.trim().to_string(), value.trim().to_string());
    }

    pairs
}

/// Cut a line at the first `#`, then at the first `;`
fn strip_comment(line: &str) -> &str {
    let line = line.split('#').next().unwrap_or_default();
    line.split(';').next().unwrap_or_default()
}
