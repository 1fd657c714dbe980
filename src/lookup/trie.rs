//! Longest-prefix-match registry over IPv4 and IPv6 prefixes.
//!
//! A plain binary trie per address family. Each source (BGP table, IXP
//! members, provider feeds, geofeeds, ...) owns its own trie; callers compose
//! lookups across tries themselves.

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use std::net::IpAddr;

struct Node<T> {
    value: Option<T>,
    children: [Option<Box<Node<T>>>; 2],
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            value: None,
            children: [None, None],
        }
    }
}

/// Prefix -> value map answering longest-prefix-match queries
pub struct PrefixTrie<T> {
    v4: Node<T>,
    v6: Node<T>,
    len: usize,
}

impl<T> Default for PrefixTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Address bits left-aligned in a u128, plus the usable bit width
fn key_bits(ip: IpAddr) -> (u128, u8) {
    match ip {
        IpAddr::V4(v4) => ((u32::from(v4) as u128) << 96, 32),
        IpAddr::V6(v6) => (u128::from(v6), 128),
    }
}

fn bit_at(key: u128, idx: u8) -> usize {
    ((key >> (127 - idx as u32)) & 1) as usize
}

impl<T> PrefixTrie<T> {
    pub fn new() -> Self {
        Self {
            v4: Node::new(),
            v6: Node::new(),
            len: 0,
        }
    }

    fn root(&self, ip: IpAddr) -> &Node<T> {
        match ip {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        }
    }

    /// Insert a prefix, returning the value it replaced
    pub fn insert(&mut self, prefix: IpNetwork, value: T) -> Option<T> {
        let (key, _) = key_bits(prefix.ip());
        let mut node = match prefix {
            IpNetwork::V4(_) => &mut self.v4,
            IpNetwork::V6(_) => &mut self.v6,
        };

        for idx in 0..prefix.prefix() {
            let bit = bit_at(key, idx);
            node = node.children[bit].get_or_insert_with(|| Box::new(Node::new()));
        }

        let previous = node.value.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Insert a single address as a host prefix (/32 or /128)
    pub fn insert_addr(&mut self, ip: IpAddr, value: T) -> Option<T> {
        self.insert(IpNetwork::from(ip), value)
    }

    /// Parse `prefix` (CIDR or bare address) and insert it
    pub fn insert_str(&mut self, prefix: &str, value: T) -> Result<Option<T>> {
        let network: IpNetwork = prefix
            .trim()
            .parse()
            .with_context(|| format!("invalid prefix: {}", prefix))?;
        Ok(self.insert(network, value))
    }

    /// Value of the most specific prefix covering `ip`
    pub fn lookup(&self, ip: IpAddr) -> Option<&T> {
        self.longest_match(ip).map(|(_, value)| value)
    }

    /// Most specific covering prefix length and its value
    pub fn longest_match(&self, ip: IpAddr) -> Option<(u8, &T)> {
        let (key, width) = key_bits(ip);
        let mut node = self.root(ip);
        let mut best = node.value.as_ref().map(|v| (0, v));

        for idx in 0..width {
            match node.children[bit_at(key, idx)].as_deref() {
                Some(child) => {
                    node = child;
                    if let Some(value) = node.value.as_ref() {
                        best = Some((idx + 1, value));
                    }
                }
                None => break,
            }
        }

        best
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.lookup(ip).is_some()
    }

    /// Number of stored prefixes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
