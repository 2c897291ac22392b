use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{ImportError, Result};
use crate::grid::Cell;
use crate::migrate::{Disaggregation, SourceFlow};
use crate::schema::SUB_INDEX_UNUSED;

/// One sparse matrix entry, in the serialized field order. `row_value` and
/// `col_value` carry persisted entity ids; the two index fields are reserved
/// for sub-compartment addressing and hold [`SUB_INDEX_UNUSED`] throughout
/// this dataset. `flip` marks entries whose sign the downstream linear
/// system inverts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoefficientRecord {
    pub row_value: u32,
    pub col_value: u32,
    pub row_index: u32,
    pub col_index: u32,
    pub amount: f64,
    pub flip: bool,
}

impl CoefficientRecord {
    pub fn new(row_value: u32, col_value: u32, amount: f64, flip: bool) -> Self {
        Self {
            row_value,
            col_value,
            row_index: SUB_INDEX_UNUSED,
            col_index: SUB_INDEX_UNUSED,
            amount,
            flip,
        }
    }
}

/// Target-taxonomy lookup: (name, categories) → persisted flow id.
pub type TargetLookup = HashMap<(String, Vec<String>), u32>;

/// Non-fatal drop counters from biosphere assembly, reported in the post-run
/// summary. Counted per emitted-candidate row/column pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DisaggregationStats {
    /// Shares whose target taxonomy has no equivalent classification.
    pub dropped_no_category: u64,
    /// Shares whose target flow key the taxonomy does not define.
    pub dropped_unmapped_target: u64,
}

fn mapped_id(ids: &[u32], index: usize, axis: &str) -> Result<u32> {
    ids.get(index).copied().ok_or_else(|| {
        ImportError::Structural(format!(
            "{axis} index {index} outside matrix of size {}",
            ids.len()
        ))
    })
}

/// Assemble the technosphere record stream in a single bounded-memory pass:
/// inter-industry purchases (flipped), then the production diagonal, then a
/// unit diagonal entry for every column the production vector left out.
///
/// The source production vector is incomplete by construction; without the
/// unit fill-in the matrix would have empty diagonal entries and the
/// downstream solve would be structurally singular. After assembly every
/// column index appears exactly once on the diagonal.
pub fn technosphere_stream<'a, T, P>(
    technosphere: T,
    production: P,
    row_ids: &'a [u32],
    col_ids: &'a [u32],
) -> impl Iterator<Item = Result<CoefficientRecord>> + 'a
where
    T: Iterator<Item = Result<Cell>> + 'a,
    P: Iterator<Item = Result<Cell>> + 'a,
{
    debug_assert_eq!(row_ids.len(), col_ids.len());
    let size = col_ids.len();
    let purchases = technosphere.map(move |cell| {
        let cell = cell?;
        Ok(CoefficientRecord::new(
            mapped_id(row_ids, cell.row, "technosphere row")?,
            mapped_id(col_ids, cell.col, "technosphere column")?,
            cell.value,
            true,
        ))
    });
    purchases.chain(DiagonalFill {
        production: Some(production),
        row_ids,
        col_ids,
        seen: vec![false; size],
        next_fill: 0,
    })
}

/// Production entries mapped onto the diagonal, followed by synthetic unit
/// entries for the columns the production stream never covered.
struct DiagonalFill<'a, P> {
    production: Option<P>,
    row_ids: &'a [u32],
    col_ids: &'a [u32],
    seen: Vec<bool>,
    next_fill: usize,
}

impl<'a, P> Iterator for DiagonalFill<'a, P>
where
    P: Iterator<Item = Result<Cell>>,
{
    type Item = Result<CoefficientRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(production) = &mut self.production {
            match production.next() {
                Some(Ok(cell)) => {
                    // The production vector addresses activities by column;
                    // its own row coordinate is irrelevant.
                    let j = cell.col;
                    return Some(match (self.row_ids.get(j), self.col_ids.get(j)) {
                        (Some(&row), Some(&col)) => {
                            self.seen[j] = true;
                            Ok(CoefficientRecord::new(row, col, cell.value, false))
                        }
                        _ => Err(ImportError::Structural(format!(
                            "production column {j} outside matrix of size {}",
                            self.col_ids.len()
                        ))),
                    });
                }
                Some(Err(e)) => return Some(Err(e)),
                None => self.production = None,
            }
        }
        while self.next_fill < self.seen.len() {
            let j = self.next_fill;
            self.next_fill += 1;
            if !self.seen[j] {
                return Some(Ok(CoefficientRecord::new(
                    self.row_ids[j],
                    self.col_ids[j],
                    1.0,
                    false,
                )));
            }
        }
        None
    }
}

struct ResolvedSplit {
    target: u32,
    fraction: f64,
}

/// Disaggregation of one distinct source row, resolved against the target
/// lookup once and reused for every triple sharing the row.
struct CacheEntry {
    splits: Vec<ResolvedSplit>,
    dropped_no_category: u64,
    dropped_unmapped_target: u64,
}

struct Pending {
    entry: Rc<CacheEntry>,
    next: usize,
    value: f64,
    col: u32,
}

/// Streaming biosphere assembly for one extension table.
///
/// Each raw triple fans out into zero or more records via the per-row
/// disaggregation list: shares without a target category are dropped (the
/// target taxonomy does not track them), shares whose key is unknown to the
/// target lookup are dropped silently, everything else emits
/// `value × fraction` against the activity column's persisted id. Drops are
/// counted in the shared run stats. The per-row resolution is memoized —
/// the adapter call is comparatively expensive and every row label recurs
/// across all activity columns.
pub struct BiosphereTable<'a, C, D> {
    cells: C,
    labels: &'a [Vec<String>],
    disaggregation: &'a D,
    targets: &'a TargetLookup,
    col_ids: &'a [u32],
    cache: HashMap<usize, Rc<CacheEntry>>,
    pending: Option<Pending>,
    stats: Rc<RefCell<DisaggregationStats>>,
}

impl<'a, C, D> BiosphereTable<'a, C, D>
where
    C: Iterator<Item = Result<Cell>>,
    D: Disaggregation,
{
    pub fn new(
        cells: C,
        labels: &'a [Vec<String>],
        disaggregation: &'a D,
        targets: &'a TargetLookup,
        col_ids: &'a [u32],
        stats: Rc<RefCell<DisaggregationStats>>,
    ) -> Self {
        Self {
            cells,
            labels,
            disaggregation,
            targets,
            col_ids,
            cache: HashMap::new(),
            pending: None,
            stats,
        }
    }

    fn resolve(&self, label: &[String]) -> CacheEntry {
        let source = SourceFlow::from_label(label);
        let mut entry = CacheEntry {
            splits: Vec::new(),
            dropped_no_category: 0,
            dropped_unmapped_target: 0,
        };
        for split in self.disaggregation.disaggregate(&source) {
            match split.categories {
                None => entry.dropped_no_category += 1,
                Some(categories) => match self.targets.get(&(split.name, categories)) {
                    Some(&target) => entry.splits.push(ResolvedSplit {
                        target,
                        fraction: split.amount,
                    }),
                    None => entry.dropped_unmapped_target += 1,
                },
            }
        }
        entry
    }
}

impl<'a, C, D> Iterator for BiosphereTable<'a, C, D>
where
    C: Iterator<Item = Result<Cell>>,
    D: Disaggregation,
{
    type Item = Result<CoefficientRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pending) = &mut self.pending {
                if pending.next < pending.entry.splits.len() {
                    let split = &pending.entry.splits[pending.next];
                    pending.next += 1;
                    return Some(Ok(CoefficientRecord::new(
                        split.target,
                        pending.col,
                        pending.value * split.fraction,
                        false,
                    )));
                }
                self.pending = None;
            }

            let cell = match self.cells.next()? {
                Ok(cell) => cell,
                Err(e) => return Some(Err(e)),
            };
            let entry = match self.cache.get(&cell.row) {
                Some(entry) => Rc::clone(entry),
                None => {
                    let label = match self.labels.get(cell.row) {
                        Some(label) => label,
                        None => {
                            return Some(Err(ImportError::Structural(format!(
                                "extension row {} has no label",
                                cell.row
                            ))))
                        }
                    };
                    let entry = Rc::new(self.resolve(label));
                    self.cache.insert(cell.row, Rc::clone(&entry));
                    entry
                }
            };
            {
                let mut stats = self.stats.borrow_mut();
                stats.dropped_no_category += entry.dropped_no_category;
                stats.dropped_unmapped_target += entry.dropped_unmapped_target;
            }
            let col = match self.col_ids.get(cell.col) {
                Some(&col) => col,
                None => {
                    return Some(Err(ImportError::Structural(format!(
                        "extension column {} outside matrix of size {}",
                        cell.col,
                        self.col_ids.len()
                    ))))
                }
            };
            if entry.splits.is_empty() {
                continue;
            }
            self.pending = Some(Pending {
                entry,
                next: 0,
                value: cell.value,
                col,
            });
        }
    }
}
