use std::collections::BTreeMap;

use crate::types::scan::BlockRange;

/// The still-uncovered parts of a block span, kept as disjoint half-open
/// intervals keyed by start.
#[derive(Debug, Clone)]
pub struct Coverage {
    uncovered: BTreeMap<u64, u64>,
}

impl Coverage {
    pub fn new(span: BlockRange) -> Self {
        let mut uncovered = BTreeMap::new();
        if !span.is_empty() {
            uncovered.insert(span.start, span.end);
        }
        Self { uncovered }
    }

    /// Mark `range` as covered.
    pub fn cover(&mut self, range: BlockRange) {
        if range.is_empty() {
            return;
        }
        // Intervals overlapping `range`: anything starting before its end
        // whose own end lies past its start.
        let overlapping: Vec<(u64, u64)> = self
            .uncovered
            .range(..range.end)
            .filter(|(_, &end)| end > range.start)
            .map(|(&start, &end)| (start, end))
            .collect();

        for (start, end) in overlapping {
            self.uncovered.remove(&start);
            if start < range.start {
                self.uncovered.insert(start, range.start);
            }
            if end > range.end {
                self.uncovered.insert(range.end, end);
            }
        }
    }

    pub fn gaps(&self) -> Vec<BlockRange> {
        self.uncovered
            .iter()
            .map(|(&start, &end)| BlockRange::new(start, end))
            .collect()
    }

    pub fn is_full(&self) -> bool {
        self.uncovered.is_empty()
    }
}
