//! Hierarchical statistics: counters registered into a tree, dumped as an
//! indented text document or as one JSON record per dump.
//!
//! Components create [`Counter`]s (shared atomic cells) and register them
//! under named groups; the dump walks the tree and snapshots whatever the
//! counters hold at that moment. Dumps are cheap enough to run on a phase
//! event.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A shared counter cell. Cloning hands out another handle to the same
/// cell. Most counters are monotonic; gauges (e.g. partition sizes) use
/// `set`/`sub`.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new() -> Self {
        Counter(Arc::new(AtomicU64::new(0)))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, v: u64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A shared vector of counters (e.g. a latency histogram).
#[derive(Debug, Clone)]
pub struct VectorCounter {
    cells: Arc<Vec<AtomicU64>>,
}

impl VectorCounter {
    pub fn new(size: usize) -> Self {
        VectorCounter {
            cells: Arc::new((0..size).map(|_| AtomicU64::new(0)).collect()),
        }
    }

    pub fn inc(&self, bucket: usize, v: u64) {
        self.cells[bucket].fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self, bucket: usize) -> u64 {
        self.cells[bucket].load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// One node of the statistics tree.
pub enum StatNode {
    Scalar {
        name: String,
        desc: String,
        counter: Counter,
    },
    Vector {
        name: String,
        desc: String,
        counter: VectorCounter,
    },
    Group(StatGroup),
}

/// A named aggregate of child stats.
pub struct StatGroup {
    name: String,
    desc: String,
    /// Regular aggregates may be summed/flattened by compact dump modes.
    regular: bool,
    children: Vec<StatNode>,
}

impl StatGroup {
    pub fn new(name: impl Into<String>, desc: impl Into<String>) -> Self {
        StatGroup {
            name: name.into(),
            desc: desc.into(),
            regular: true,
            children: Vec::new(),
        }
    }

    /// Mark this group as irregular: compact dumps keep its children
    /// separate instead of summing them.
    pub fn irregular(mut self) -> Self {
        self.regular = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_counter(&mut self, name: impl Into<String>, desc: impl Into<String>) -> Counter {
        let c = Counter::new();
        self.children.push(StatNode::Scalar {
            name: name.into(),
            desc: desc.into(),
            counter: c.clone(),
        });
        c
    }

    pub fn add_vector(
        &mut self,
        name: impl Into<String>,
        desc: impl Into<String>,
        size: usize,
    ) -> VectorCounter {
        let c = VectorCounter::new(size);
        self.children.push(StatNode::Vector {
            name: name.into(),
            desc: desc.into(),
            counter: c.clone(),
        });
        c
    }

    /// Register an existing counter handle under this group.
    pub fn append_counter(
        &mut self,
        name: impl Into<String>,
        desc: impl Into<String>,
        counter: Counter,
    ) {
        self.children.push(StatNode::Scalar {
            name: name.into(),
            desc: desc.into(),
            counter,
        });
    }

    /// Register an existing vector-counter handle under this group.
    pub fn append_vector(
        &mut self,
        name: impl Into<String>,
        desc: impl Into<String>,
        counter: VectorCounter,
    ) {
        self.children.push(StatNode::Vector {
            name: name.into(),
            desc: desc.into(),
            counter,
        });
    }

    pub fn add_group(&mut self, group: StatGroup) {
        self.children.push(StatNode::Group(group));
    }

    /// Render as an indented text document.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        self.write_text(&mut out, 0);
        out
    }

    fn write_text(&self, out: &mut String, depth: usize) {
        let pad = " ".repeat(depth);
        let _ = writeln!(out, "{pad}{}: # {}", self.name, self.desc);
        for child in &self.children {
            match child {
                StatNode::Scalar {
                    name,
                    desc,
                    counter,
                } => {
                    let _ = writeln!(out, "{pad} {name}: {} # {desc}", counter.get());
                }
                StatNode::Vector {
                    name,
                    desc,
                    counter,
                } => {
                    let vals: Vec<String> =
                        (0..counter.len()).map(|i| counter.get(i).to_string()).collect();
                    let _ = writeln!(out, "{pad} {name}: [{}] # {desc}", vals.join(", "));
                }
                StatNode::Group(g) => g.write_text(out, depth + 1),
            }
        }
    }

    /// Snapshot as a JSON value. With `compact`, regular aggregates are
    /// summed into one scalar per leaf name instead of listed per child.
    pub fn to_json(&self, compact: bool) -> serde_json::Value {
        use serde_json::{Map, Value};
        let mut map = Map::new();
        if compact && self.regular && self.children.iter().all(|c| matches!(c, StatNode::Group(_)))
        {
            // Sum sibling groups leaf-by-leaf (e.g. per-bank stats).
            let mut acc: Map<String, Value> = Map::new();
            for child in &self.children {
                if let StatNode::Group(g) = child {
                    let sub = g.to_json(compact);
                    if let Value::Object(obj) = sub {
                        for (k, v) in obj {
                            match (acc.get(&k), v) {
                                (Some(Value::Number(a)), Value::Number(b)) => {
                                    let sum = a.as_u64().unwrap_or(0) + b.as_u64().unwrap_or(0);
                                    acc.insert(k, Value::from(sum));
                                }
                                (_, v) => {
                                    acc.insert(k, v);
                                }
                            }
                        }
                    }
                }
            }
            return Value::Object(acc);
        }
        for child in &self.children {
            match child {
                StatNode::Scalar { name, counter, .. } => {
                    map.insert(name.clone(), Value::from(counter.get()));
                }
                StatNode::Vector { name, counter, .. } => {
                    let vals: Vec<u64> = (0..counter.len()).map(|i| counter.get(i)).collect();
                    map.insert(name.clone(), Value::from(vals));
                }
                StatNode::Group(g) => {
                    map.insert(g.name.clone(), g.to_json(compact));
                }
            }
        }
        Value::Object(map)
    }
}

/// Appends one JSON record per dump to a file; the row-per-dump backend.
pub struct JsonStatsWriter {
    out: BufWriter<File>,
    compact: bool,
    dumps: u64,
}

impl JsonStatsWriter {
    pub fn create(path: &Path, compact: bool) -> io::Result<Self> {
        Ok(JsonStatsWriter {
            out: BufWriter::new(File::create(path)?),
            compact,
            dumps: 0,
        })
    }

    pub fn dump(&mut self, root: &StatGroup, phase: u64) -> io::Result<()> {
        let mut rec = serde_json::Map::new();
        rec.insert("dump".into(), serde_json::Value::from(self.dumps));
        rec.insert("phase".into(), serde_json::Value::from(phase));
        rec.insert(root.name().to_string(), root.to_json(self.compact));
        serde_json::to_writer(&mut self.out, &serde_json::Value::Object(rec))?;
        self.out.write_all(b"\n")?;
        self.dumps += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Writes the full tree as an indented text document, truncating the file
/// on every dump.
pub fn dump_text(path: &Path, root: &StatGroup) -> io::Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    f.write_all(root.to_text().as_bytes())?;
    f.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> (StatGroup, Counter) {
        let mut root = StatGroup::new("sim", "simulation stats");
        let mut cache = StatGroup::new("l1d", "L1 data cache");
        let hits = cache.add_counter("hGETS", "GETS hits");
        hits.add(5);
        let hist = cache.add_vector("lat", "latency histogram", 3);
        hist.inc(1, 2);
        root.add_group(cache);
        (root, hits)
    }

    #[test]
    fn text_dump_is_indented() {
        let (root, _) = sample_tree();
        let text = root.to_text();
        assert!(text.contains("sim: # simulation stats"));
        assert!(text.contains(" hGETS: 5 # GETS hits"));
        assert!(text.contains("[0, 2, 0]"));
    }

    #[test]
    fn counters_share_cells() {
        let (root, hits) = sample_tree();
        hits.inc();
        let json = root.to_json(false);
        assert_eq!(json["l1d"]["hGETS"], 6);
    }

    #[test]
    fn compact_sums_regular_groups() {
        let mut root = StatGroup::new("mem", "controller");
        for b in 0..2 {
            let mut bank = StatGroup::new(format!("bank-{b}"), "bank stats");
            bank.add_counter("rd", "reads").add(3);
            root.add_group(bank);
        }
        let json = root.to_json(true);
        assert_eq!(json["rd"], 6);
        let full = root.to_json(false);
        assert_eq!(full["bank-0"]["rd"], 3);
    }

    #[test]
    fn json_writer_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.jsonl");
        let (root, _) = sample_tree();
        let mut w = JsonStatsWriter::create(&path, false).unwrap();
        w.dump(&root, 0).unwrap();
        w.dump(&root, 1).unwrap();
        w.flush().unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.lines().count(), 2);
        let rec: serde_json::Value = serde_json::from_str(body.lines().nth(1).unwrap()).unwrap();
        assert_eq!(rec["phase"], 1);
        assert_eq!(rec["sim"]["l1d"]["hGETS"], 5);
    }
}
