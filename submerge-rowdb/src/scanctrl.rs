//! Scan controller and factory (§4.3, component C3).
//!
//! Range derivation only narrows the cursor's iteration window by the
//! leading key column; the residual predicate is always the *full*
//! parsed filter rather than the range-constrained atoms subtracted out
//! of it. A basic scanner that applies the full predicate to every
//! decoded row is correct regardless of how tightly the range narrows
//! iteration -- residual-predicate completeness (§8 property 4) holds
//! even when range derivation is conservative, so this trades a little
//! redundant re-evaluation of already-range-guaranteed atoms for never
//! having to prove the subtraction is sound for every column-type and
//! operator combination.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use submerge_base::Result;

use crate::codec::{FilterOp, Value};
use crate::filter::{self, FilterExpr};
use crate::rowcodec::RowCodec;
use crate::schema::RowInfo;
use crate::storage::Bound as StorageBound;

/// One end of a column-level range, before it is encoded to bytes.
#[derive(Debug, Clone, PartialEq)]
enum Edge {
    Unbounded,
    Included(Value),
    Excluded(Value),
}

/// A key subrange. `Empty` is the distinguished sentinel (§4.3) for a
/// disjunct whose derived low bound exceeds its high bound; such
/// subranges are filtered out of the scan plan before it is ever handed
/// to a scanner; the variant exists so the construction step can name
/// the case explicitly rather than silently dropping it.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeBound {
    Empty,
    Unbounded,
    Included(Vec<u8>),
    Excluded(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subrange {
    pub low: RangeBound,
    pub high: RangeBound,
}

impl Subrange {
    fn is_empty(&self) -> bool {
        matches!(self.low, RangeBound::Empty) || matches!(self.high, RangeBound::Empty)
    }

    fn low_sort_key(&self) -> &[u8] {
        match &self.low {
            RangeBound::Unbounded => &[],
            RangeBound::Included(b) | RangeBound::Excluded(b) => b,
            RangeBound::Empty => &[],
        }
    }

    pub fn to_storage_bounds(&self) -> (StorageBound, StorageBound) {
        let lo = match &self.low {
            RangeBound::Unbounded | RangeBound::Empty => StorageBound::Unbounded,
            RangeBound::Included(b) => StorageBound::Included(b.clone()),
            RangeBound::Excluded(b) => StorageBound::Excluded(b.clone()),
        };
        let hi = match &self.high {
            RangeBound::Unbounded | RangeBound::Empty => StorageBound::Unbounded,
            RangeBound::Included(b) => StorageBound::Included(b.clone()),
            RangeBound::Excluded(b) => StorageBound::Excluded(b.clone()),
        };
        (lo, hi)
    }
}

/// Describes a scan: an ordered sequence of subranges plus the residual
/// predicate and the decoder bound to the current schema version.
pub struct ScanController {
    plan: Vec<Subrange>,
    idx: usize,
    residual: FilterExpr,
    codec: RowCodec,
}

impl ScanController {
    pub fn new(plan: Vec<Subrange>, residual: FilterExpr, codec: RowCodec) -> Self {
        ScanController { plan, idx: 0, residual, codec }
    }

    pub fn current_subrange(&self) -> Option<&Subrange> {
        self.plan.get(self.idx)
    }

    /// Advances to the next subrange. Returns `false` when none remain.
    pub fn next(&mut self) -> bool {
        self.idx += 1;
        self.idx < self.plan.len()
    }

    pub fn decoder(&self) -> RowCodec {
        self.codec.clone()
    }

    /// The row info the current decoder is bound to, borrowed straight
    /// off `self` rather than through a cloned [`RowCodec`] -- callers
    /// that need a `&RowInfo` tied to `&self`'s lifetime (e.g.
    /// [`crate::sorted::RowStream::schema`]) should use this instead of
    /// `self.decoder().info`, which would borrow from a temporary.
    pub fn schema(&self) -> &RowInfo {
        self.codec.info.as_ref()
    }

    pub fn residual(&self) -> &FilterExpr {
        &self.residual
    }

    pub fn rebind_decoder(&mut self, codec: RowCodec) {
        self.codec = codec;
    }
}

/// One (filter, schema) pairing's compiled, reusable state: just the
/// parsed expression today, but a distinct type from `FilterExpr` so the
/// weak cache has something with identity to key on.
pub struct CompiledFilter {
    pub expr: FilterExpr,
}

/// Builds [`ScanController`]s from (filter string, row info), caching
/// the parse weakly by the filter's canonical string (§4.3) plus a
/// second cache from the as-given string to its canonical form, so a
/// repeated caller that always passes the same original string skips
/// reparsing even before the canonical-keyed lookup.
pub struct ScanControllerFactory {
    schema: Arc<RowInfo>,
    canonical_of: DashMap<String, String>,
    compiled: DashMap<String, Weak<CompiledFilter>>,
}

impl ScanControllerFactory {
    pub fn new(schema: Arc<RowInfo>) -> Self {
        ScanControllerFactory { schema, canonical_of: DashMap::new(), compiled: DashMap::new() }
    }

    /// The key a caller would otherwise need to build by hand: a stable
    /// cache key for this (schema, filter string) pairing, matching the
    /// weak-factory-cache convention a table keeps over its
    /// `ScanControllerFactory`s (§2 data-flow paragraph).
    pub fn cache_key(row_type: &str, filter_str: &str) -> String {
        let mut hasher = DefaultHasher::new();
        row_type.hash(&mut hasher);
        filter_str.hash(&mut hasher);
        format!("{row_type}#{:x}", hasher.finish())
    }

    fn compiled_filter(&self, filter_str: &str) -> Result<Arc<CompiledFilter>> {
        let canonical = if let Some(c) = self.canonical_of.get(filter_str) {
            c.clone()
        } else {
            let expr = filter::parse(filter_str)?;
            let canonical = expr.to_string();
            self.canonical_of.insert(filter_str.to_string(), canonical.clone());
            if self.compiled.get(&canonical).and_then(|w| w.upgrade()).is_none() {
                let arc = Arc::new(CompiledFilter { expr });
                self.compiled.insert(canonical.clone(), Arc::downgrade(&arc));
                return Ok(arc);
            }
            canonical
        };
        if let Some(arc) = self.compiled.get(&canonical).and_then(|w| w.upgrade()) {
            return Ok(arc);
        }
        let expr = filter::parse(filter_str)?;
        let arc = Arc::new(CompiledFilter { expr });
        self.compiled.insert(canonical, Arc::downgrade(&arc));
        Ok(arc)
    }

    /// Builds a scan controller for `filter_str`, bound to `codec`.
    pub fn controller_for(&self, filter_str: &str, codec: RowCodec) -> Result<ScanController> {
        let compiled = self.compiled_filter(filter_str)?;
        let plan = derive_scan_plan(&compiled.expr, &self.schema);
        Ok(ScanController::new(plan, compiled.expr.clone(), codec))
    }
}

/// Lowers a parsed filter to disjunctive normal form and derives one
/// subrange per disjunct, narrowed by whatever constraints the
/// disjunct places on the table's leading key column. Empty subranges
/// (§4.3 sentinel) are dropped; the remaining subranges are sorted by
/// ascending low bound.
fn derive_scan_plan(expr: &FilterExpr, schema: &RowInfo) -> Vec<Subrange> {
    let Some(leading) = schema.key_columns.first() else {
        return vec![Subrange { low: RangeBound::Unbounded, high: RangeBound::Unbounded }];
    };
    let dnf = expr.to_dnf();
    // A `FalseFilter`-equivalent disjunct set (empty DNF) yields no
    // subranges at all -- the §9 open question's canonicalization of the
    // false case: zero subranges rather than one empty-sentinel entry.
    let only_last_key_column = schema.key_columns.len() == 1;
    let mut subranges: Vec<Subrange> = dnf
        .iter()
        .map(|atoms| derive_subrange(atoms, &leading.name, leading.ty, leading.descending, only_last_key_column))
        .filter(|s| !s.is_empty())
        .collect();
    subranges.sort_by(|a, b| a.low_sort_key().cmp(b.low_sort_key()));
    subranges
}

fn derive_subrange(
    atoms: &[(String, FilterOp, Value)],
    leading_column: &str,
    ty: crate::codec::ColumnType,
    descending: bool,
    only_key_column: bool,
) -> Subrange {
    let mut low = Edge::Unbounded;
    let mut high = Edge::Unbounded;
    for (column, op, arg) in atoms {
        if column != leading_column {
            continue;
        }
        match op {
            FilterOp::Eq => {
                low = tighten_low(low, Edge::Included(arg.clone()));
                high = tighten_high(high, Edge::Included(arg.clone()));
            }
            FilterOp::Ge => low = tighten_low(low, Edge::Included(arg.clone())),
            FilterOp::Gt => low = tighten_low(low, Edge::Excluded(arg.clone())),
            FilterOp::Le => high = tighten_high(high, Edge::Included(arg.clone())),
            FilterOp::Lt => high = tighten_high(high, Edge::Excluded(arg.clone())),
            FilterOp::Ne => {}
        }
    }
    // Empty iff the derived window is vacuous: [l, h] is empty only when
    // l > h, but any combination with an excluded endpoint is already
    // empty when l == h too (open on that side admits nothing there).
    let is_empty = match (&low, &high) {
        (Edge::Unbounded, _) | (_, Edge::Unbounded) => false,
        (Edge::Included(l), Edge::Included(h)) => l.cmp_typed(h) == std::cmp::Ordering::Greater,
        (l_edge, h_edge) => edge_value(l_edge).cmp_typed(edge_value(h_edge)) != std::cmp::Ordering::Less,
    };
    if is_empty {
        return Subrange { low: RangeBound::Empty, high: RangeBound::Empty };
    }
    let direction = if descending { crate::codec::Direction::Descending } else { crate::codec::Direction::Ascending };
    let pos = if only_key_column { crate::codec::Position::Last } else { crate::codec::Position::NonLast };
    let encode_edge = |edge: &Edge| -> RangeBound {
        match edge {
            Edge::Unbounded => RangeBound::Unbounded,
            Edge::Included(v) => {
                let mut buf = Vec::new();
                let _ = crate::codec::key::encode(&mut buf, Some(v), ty, false, pos, direction);
                RangeBound::Included(buf)
            }
            Edge::Excluded(v) => {
                let mut buf = Vec::new();
                let _ = crate::codec::key::encode(&mut buf, Some(v), ty, false, pos, direction);
                RangeBound::Excluded(buf)
            }
        }
    };
    let (low_bound, high_bound) = if descending {
        // A descending key column's byte order is inverted, so a
        // logical lower bound becomes a byte-wise upper bound and vice
        // versa.
        (encode_edge(&high), encode_edge(&low))
    } else {
        (encode_edge(&low), encode_edge(&high))
    };
    // When the leading column isn't the whole key, its `NonLast` encoding
    // is only a prefix of a real row key (more columns follow). A real
    // key with that prefix therefore sorts strictly after the bare
    // prefix bytes, so an `Included` byte-space upper bound equal to the
    // prefix would wrongly exclude every row it's supposed to match.
    // Widen it to the prefix's successor, open on that side, instead.
    let high_bound = if only_key_column {
        high_bound
    } else {
        match high_bound {
            RangeBound::Included(bytes) => match prefix_successor(&bytes) {
                Some(succ) => RangeBound::Excluded(succ),
                None => RangeBound::Unbounded,
            },
            other => other,
        }
    };
    Subrange { low: low_bound, high: high_bound }
}

/// The smallest byte string that is strictly greater than every string
/// having `prefix` as a prefix, or `None` if no such string exists (every
/// byte of `prefix` is `0xff`, including the empty prefix).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(&last) = out.last() {
        if last == 0xff {
            out.pop();
        } else {
            *out.last_mut().unwrap() += 1;
            return Some(out);
        }
    }
    None
}

fn tighten_low(current: Edge, candidate: Edge) -> Edge {
    match (&current, &candidate) {
        (Edge::Unbounded, _) => candidate,
        (_, Edge::Unbounded) => current,
        (Edge::Included(a), Edge::Included(b)) => {
            if b.cmp_typed(a) == std::cmp::Ordering::Greater {
                candidate
            } else {
                current
            }
        }
        _ => {
            let a = edge_value(&current);
            let b = edge_value(&candidate);
            if b.cmp_typed(a) != std::cmp::Ordering::Less {
                candidate
            } else {
                current
            }
        }
    }
}

fn tighten_high(current: Edge, candidate: Edge) -> Edge {
    match (&current, &candidate) {
        (Edge::Unbounded, _) => candidate,
        (_, Edge::Unbounded) => current,
        (Edge::Included(a), Edge::Included(b)) => {
            if b.cmp_typed(a) == std::cmp::Ordering::Less {
                candidate
            } else {
                current
            }
        }
        _ => {
            let a = edge_value(&current);
            let b = edge_value(&candidate);
            if b.cmp_typed(a) != std::cmp::Ordering::Greater {
                candidate
            } else {
                current
            }
        }
    }
}

fn edge_value(edge: &Edge) -> &Value {
    match edge {
        Edge::Included(v) | Edge::Excluded(v) => v,
        Edge::Unbounded => unreachable!("edge_value called on Unbounded"),
    }
}
