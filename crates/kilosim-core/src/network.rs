//! Fixed-delay network model.
//!
//! Parses a text file with one edge per line (`src dst delay-in-cycles`),
//! symmetric, and answers round-trip-time queries between named
//! endpoints. Missing edges cost nothing, loudly.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use log::warn;

pub struct Network {
    delays: HashMap<(String, String), u32>,
}

impl Network {
    /// A network where everything is adjacent at zero delay.
    pub fn flat() -> Self {
        Network {
            delays: HashMap::new(),
        }
    }

    pub fn from_file(path: &Path) -> io::Result<Network> {
        let body = fs::read_to_string(path)?;
        Network::parse(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn parse(body: &str) -> Result<Network, String> {
        let mut delays = HashMap::new();
        for (lineno, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut it = line.split_whitespace();
            let (src, dst, delay) = match (it.next(), it.next(), it.next()) {
                (Some(s), Some(d), Some(w)) => (s, d, w),
                _ => return Err(format!("line {}: expected 'src dst delay'", lineno + 1)),
            };
            let delay: u32 = delay
                .parse()
                .map_err(|_| format!("line {}: bad delay {delay}", lineno + 1))?;
            let k1 = (src.to_string(), dst.to_string());
            let k2 = (dst.to_string(), src.to_string());
            if delays.contains_key(&k1) || delays.contains_key(&k2) {
                return Err(format!("line {}: duplicate edge {src} {dst}", lineno + 1));
            }
            delays.insert(k1, delay);
            delays.insert(k2, delay);
        }
        Ok(Network { delays })
    }

    /// Round-trip time between two endpoints. Unknown pairs get zero
    /// delay and a warning; a sloppy topology file should not kill a run.
    pub fn rtt(&self, src: &str, dst: &str) -> u32 {
        match self.delays.get(&(src.to_string(), dst.to_string())) {
            Some(&d) => 2 * d,
            None => {
                warn!("{src} and {dst} have no entry in the network description, assuming 0 latency");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_answers_symmetrically() {
        let net = Network::parse("l1d-0 l2 3\nl2 mem-0 12\n").unwrap();
        assert_eq!(net.rtt("l1d-0", "l2"), 6);
        assert_eq!(net.rtt("l2", "l1d-0"), 6);
        assert_eq!(net.rtt("l2", "mem-0"), 24);
    }

    #[test]
    fn missing_edges_cost_nothing() {
        let net = Network::parse("a b 1\n").unwrap();
        assert_eq!(net.rtt("a", "z"), 0);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Network::parse("a b\n").is_err());
        assert!(Network::parse("a b fast\n").is_err());
        assert!(Network::parse("a b 1\nb a 2\n").is_err());
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let net = Network::parse("# topology\n\na b 4\n").unwrap();
        assert_eq!(net.rtt("a", "b"), 8);
    }
}
