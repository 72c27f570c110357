// Per-opcode request counters, reported by the admin `show stat` command.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Default, Clone, Copy)]
pub struct OpStat {
    pub requests: u64,
    pub errors: u64,
}

/// Request counters keyed by opcode. Single-threaded, so a RefCell is
/// all the synchronisation needed.
#[derive(Default)]
pub struct Stat {
    ops: RefCell<BTreeMap<&'static str, OpStat>>,
    started: Option<Instant>,
}

impl Stat {
    pub fn new() -> Self {
        Self {
            ops: RefCell::new(BTreeMap::new()),
            started: Some(Instant::now()),
        }
    }

    pub fn record(&self, op: &'static str, ok: bool) {
        let mut ops = self.ops.borrow_mut();
        let entry = ops.entry(op).or_default();
        entry.requests += 1;
        if !ok {
            entry.errors += 1;
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Render counters in the admin console's YAML-ish shape.
    pub fn render(&self) -> String {
        let ops = self.ops.borrow();
        let mut out = String::from("statistics:\n");
        for (name, stat) in ops.iter() {
            out.push_str(&format!(
                "  {}: {{ rps: {}, errors: {} }}\n",
                name, stat.requests, stat.errors
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stat = Stat::new();
        stat.record("INSERT", true);
        stat.record("INSERT", false);
        stat.record("SELECT", true);
        let rendered = stat.render();
        assert!(rendered.contains("INSERT: { rps: 2, errors: 1 }"));
        assert!(rendered.contains("SELECT: { rps: 1, errors: 0 }"));
    }
}
