/// Shared constants for the import pipeline.
/// Single source of truth for label field positions and record layout.

/// Sentinel written into the reserved sub-index fields of every coefficient
/// record. The dataset has no sub-compartment addressing, so both sub-index
/// columns carry this value.
pub const SUB_INDEX_UNUSED: u32 = i32::MAX as u32;

/// Heuristic window (rows and columns) inspected by offset detection.
pub const OFFSET_WINDOW: usize = 25;

// ── Technosphere row labels (one product flow per row) ──────────────────────
pub mod flow_label {
    pub const REGION: usize = 0;
    pub const NAME: usize = 1;
    pub const CODE_1: usize = 2;
    pub const CODE_2: usize = 3;
    pub const UNIT: usize = 4;
}

// ── Technosphere column labels (one activity per column) ────────────────────
pub mod activity_label {
    pub const REGION: usize = 0;
    pub const NAME: usize = 1;
    pub const CODE_1: usize = 2;
    pub const CODE_2: usize = 3;
}

// ── Extension-table row labels (one source biosphere flow per row) ──────────
pub mod extension_label {
    pub const NAME: usize = 0;
    pub const UNIT: usize = 1;
    pub const COMPARTMENT: usize = 2;
}

/// Field layout of a serialized coefficient record, as (name, dtype) pairs.
pub fn record_dtype() -> Vec<(String, String)> {
    [
        ("row_value", "u4"),
        ("col_value", "u4"),
        ("row_index", "u4"),
        ("col_index", "u4"),
        ("amount", "f8"),
        ("flip", "bool"),
    ]
    .iter()
    .map(|(n, t)| (n.to_string(), t.to_string()))
    .collect()
}
