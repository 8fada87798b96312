//! Key disciplines
//!
//! The tree engine is shared by spatial and ordered indexes. Everything
//! that depends on what a key *means* (bounding, child choice, split
//! distribution, ordering) goes through [`KeyDiscipline`].
//!
//! Interior entries are tuples `low.. ++ high.. ++ [Int(child)]` where
//! `low`/`high` are the corners of the child's bound. Leaf tuples carry
//! the key as a prefix and map to a bound through [`KeyDiscipline::leaf_bound`].

use std::cmp::Ordering;
use std::fmt;
use strata_common::{Error, Field, KeyConfig, PageId, Result, Tuple};

/// Bound of a key, a leaf page, or a subtree
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyBound {
    pub low: Vec<Field>,
    pub high: Vec<Field>,
}

impl KeyBound {
    #[must_use]
    pub const fn new(low: Vec<Field>, high: Vec<Field>) -> Self {
        Self { low, high }
    }

    /// Degenerate bound of a single key
    #[must_use]
    pub fn point(key: Vec<Field>) -> Self {
        Self {
            low: key.clone(),
            high: key,
        }
    }
}

/// Build the interior entry pointing at `child`
#[must_use]
pub fn interior_tuple(bound: &KeyBound, child: PageId) -> Tuple {
    let mut fields = Vec::with_capacity(bound.low.len() * 2 + 1);
    fields.extend(bound.low.iter().cloned());
    fields.extend(bound.high.iter().cloned());
    fields.push(Field::Int(i64::from(child.as_u32())));
    Tuple::new(fields)
}

/// Split an interior entry into the child's bound and page id
pub fn parse_interior(tuple: Tuple, width: usize) -> Result<(KeyBound, PageId)> {
    let mut fields = tuple.into_fields();
    if fields.len() != 2 * width + 1 {
        return Err(Error::corruption(format!(
            "interior entry has {} fields, expected {}",
            fields.len(),
            2 * width + 1
        )));
    }
    let child = fields
        .pop()
        .and_then(|f| f.as_i64())
        .and_then(|raw| u32::try_from(raw).ok())
        .map(PageId::new)
        .ok_or_else(|| Error::corruption("interior entry without child pointer"))?;
    let high = fields.split_off(width);
    Ok((KeyBound::new(fields, high), child))
}

/// How an overflowing page is divided
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitPlan {
    /// Entry indices in distribution order
    pub order: Vec<usize>,
    /// Entries `order[..split_at]` stay left, the rest move right
    pub split_at: usize,
}

/// Search predicate evaluated against entry bounds
#[derive(Clone, Debug, PartialEq)]
pub enum SearchPredicate {
    /// Every tuple
    All,
    /// Tuples whose key bound intersects the given bound
    Intersects(KeyBound),
}

impl SearchPredicate {
    /// Exact key match; the key must carry every key field
    #[must_use]
    pub fn point(key: Vec<Field>) -> Self {
        Self::Intersects(KeyBound::point(key))
    }

    /// Inclusive key range for ordered indexes
    #[must_use]
    pub const fn range(low: Vec<Field>, high: Vec<Field>) -> Self {
        Self::Intersects(KeyBound::new(low, high))
    }

    /// Box query for spatial indexes
    #[must_use]
    pub fn rect(min: &[f64], max: &[f64]) -> Self {
        Self::Intersects(KeyBound::new(
            min.iter().copied().map(Field::Double).collect(),
            max.iter().copied().map(Field::Double).collect(),
        ))
    }

    pub(crate) fn admits(&self, discipline: &dyn KeyDiscipline, bound: &KeyBound) -> bool {
        match self {
            Self::All => true,
            Self::Intersects(query) => discipline.intersects(bound, query),
        }
    }
}

/// Key semantics plugged into the tree engine
pub trait KeyDiscipline: Send + Sync + fmt::Debug {
    /// Fields in each corner of a bound
    fn bound_width(&self) -> usize;

    /// Reject tuples whose key the index cannot store
    fn validate(&self, tuple: &Tuple) -> Result<()>;

    fn leaf_bound(&self, tuple: &Tuple) -> Result<KeyBound>;

    fn union(&self, a: &KeyBound, b: &KeyBound) -> KeyBound;

    fn covers(&self, outer: &KeyBound, inner: &KeyBound) -> bool;

    fn intersects(&self, a: &KeyBound, b: &KeyBound) -> bool;

    /// Index of the child that should receive `key`
    fn choose_child(&self, children: &[KeyBound], key: &KeyBound) -> usize;

    fn split_plan(&self, bounds: &[KeyBound]) -> SplitPlan;

    /// Entries are kept sorted within a page
    fn is_ordered(&self) -> bool;

    /// Reject a second tuple with an equal key
    fn is_unique(&self) -> bool {
        false
    }

    /// Compare the key prefixes of two tuples
    fn compare_keys(&self, a: &Tuple, b: &Tuple) -> Ordering;

    /// Order in which the bulk loader expects (or arranges) tuples
    fn bulk_order(&self, a: &Tuple, b: &Tuple) -> Ordering {
        self.compare_keys(a, b).then_with(|| a.cmp(b))
    }
}

/// Union of every bound, or `None` for an empty page
pub fn union_all<'a>(
    discipline: &dyn KeyDiscipline,
    mut bounds: impl Iterator<Item = &'a KeyBound>,
) -> Option<KeyBound> {
    let first = bounds.next()?.clone();
    Some(bounds.fold(first, |acc, b| discipline.union(&acc, b)))
}

/// Build the discipline described by a key configuration
#[must_use]
pub fn discipline_for(key: &KeyConfig) -> std::sync::Arc<dyn KeyDiscipline> {
    match key {
        KeyConfig::Spatial { dimensions } => std::sync::Arc::new(SpatialDiscipline::new(*dimensions)),
        KeyConfig::Ordered { key_fields, unique } => {
            std::sync::Arc::new(OrderedDiscipline::new(*key_fields, *unique))
        }
    }
}

fn coord(field: &Field) -> f64 {
    field.as_f64().unwrap_or(f64::NAN)
}

/// R-tree keys: `dimensions` minimum coordinates then `dimensions` maximum
/// coordinates
#[derive(Clone, Debug)]
pub struct SpatialDiscipline {
    dimensions: usize,
}

impl SpatialDiscipline {
    #[must_use]
    pub const fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn extent(&self, b: &KeyBound, dim: usize) -> f64 {
        coord(&b.high[dim]) - coord(&b.low[dim])
    }

    fn area(&self, b: &KeyBound) -> f64 {
        (0..self.dimensions).map(|d| self.extent(b, d)).product()
    }

    fn margin(&self, b: &KeyBound) -> f64 {
        (0..self.dimensions).map(|d| self.extent(b, d)).sum()
    }

    fn overlap(&self, a: &KeyBound, b: &KeyBound) -> f64 {
        (0..self.dimensions)
            .map(|d| {
                let lo = coord(&a.low[d]).max(coord(&b.low[d]));
                let hi = coord(&a.high[d]).min(coord(&b.high[d]));
                (hi - lo).max(0.0)
            })
            .product()
    }

    fn center(&self, tuple: &Tuple, dim: usize) -> f64 {
        let fields = tuple.fields();
        let low = fields.get(dim).map_or(0.0, coord);
        let high = fields.get(dim + self.dimensions).map_or(0.0, coord);
        (low + high) / 2.0
    }

    /// Prefix and suffix unions of `bounds` taken in `order`
    fn sweeps(&self, bounds: &[KeyBound], order: &[usize]) -> (Vec<KeyBound>, Vec<KeyBound>) {
        let mut prefix: Vec<KeyBound> = Vec::with_capacity(order.len());
        for &i in order {
            let next = prefix
                .last()
                .map_or_else(|| bounds[i].clone(), |acc| self.union(acc, &bounds[i]));
            prefix.push(next);
        }
        let mut suffix: Vec<KeyBound> = Vec::with_capacity(order.len());
        for &i in order.iter().rev() {
            let next = suffix
                .last()
                .map_or_else(|| bounds[i].clone(), |acc| self.union(acc, &bounds[i]));
            suffix.push(next);
        }
        suffix.reverse();
        (prefix, suffix)
    }
}

impl KeyDiscipline for SpatialDiscipline {
    fn bound_width(&self) -> usize {
        self.dimensions
    }

    fn validate(&self, tuple: &Tuple) -> Result<()> {
        let fields = tuple.fields();
        if fields.len() < 2 * self.dimensions {
            return Err(Error::invalid_tuple(format!(
                "spatial key needs {} coordinates, tuple has {} fields",
                2 * self.dimensions,
                fields.len()
            )));
        }
        for d in 0..self.dimensions {
            let (Some(low), Some(high)) = (fields[d].as_f64(), fields[d + self.dimensions].as_f64())
            else {
                return Err(Error::invalid_tuple(format!("coordinate {d} is not numeric")));
            };
            if low.is_nan() || high.is_nan() || low > high {
                return Err(Error::invalid_tuple(format!(
                    "dimension {d} has min {low} above max {high}"
                )));
            }
        }
        Ok(())
    }

    fn leaf_bound(&self, tuple: &Tuple) -> Result<KeyBound> {
        let fields = tuple.fields();
        if fields.len() < 2 * self.dimensions {
            return Err(Error::invalid_tuple("tuple shorter than its spatial key"));
        }
        let corner = |range: std::ops::Range<usize>| {
            fields[range].iter().map(|f| Field::Double(coord(f))).collect()
        };
        Ok(KeyBound::new(
            corner(0..self.dimensions),
            corner(self.dimensions..2 * self.dimensions),
        ))
    }

    fn union(&self, a: &KeyBound, b: &KeyBound) -> KeyBound {
        let low = (0..self.dimensions)
            .map(|d| Field::Double(coord(&a.low[d]).min(coord(&b.low[d]))))
            .collect();
        let high = (0..self.dimensions)
            .map(|d| Field::Double(coord(&a.high[d]).max(coord(&b.high[d]))))
            .collect();
        KeyBound::new(low, high)
    }

    fn covers(&self, outer: &KeyBound, inner: &KeyBound) -> bool {
        (0..self.dimensions).all(|d| {
            coord(&outer.low[d]) <= coord(&inner.low[d])
                && coord(&inner.high[d]) <= coord(&outer.high[d])
        })
    }

    fn intersects(&self, a: &KeyBound, b: &KeyBound) -> bool {
        (0..self.dimensions).all(|d| {
            coord(&a.low[d]) <= coord(&b.high[d]) && coord(&b.low[d]) <= coord(&a.high[d])
        })
    }

    fn choose_child(&self, children: &[KeyBound], key: &KeyBound) -> usize {
        let mut best = 0;
        let mut best_cost = (f64::INFINITY, f64::INFINITY);
        for (i, child) in children.iter().enumerate() {
            let area = self.area(child);
            let enlargement = self.area(&self.union(child, key)) - area;
            let cost = (enlargement, area);
            if cost.0 < best_cost.0 || (cost.0 == best_cost.0 && cost.1 < best_cost.1) {
                best = i;
                best_cost = cost;
            }
        }
        best
    }

    fn split_plan(&self, bounds: &[KeyBound]) -> SplitPlan {
        let n = bounds.len();
        let min_fill = (n * 2 / 5).clamp(1, (n / 2).max(1));
        let candidates = min_fill..=(n - min_fill).max(min_fill);

        // Axis with the smallest total margin over every distribution
        let mut best_axis: Option<(f64, Vec<usize>)> = None;
        for axis in 0..self.dimensions {
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by(|&a, &b| {
                coord(&bounds[a].low[axis])
                    .total_cmp(&coord(&bounds[b].low[axis]))
                    .then(coord(&bounds[a].high[axis]).total_cmp(&coord(&bounds[b].high[axis])))
            });
            let (prefix, suffix) = self.sweeps(bounds, &order);
            let margin: f64 = candidates
                .clone()
                .filter(|k| *k < n)
                .map(|k| self.margin(&prefix[k - 1]) + self.margin(&suffix[k]))
                .sum();
            if best_axis.as_ref().is_none_or(|(m, _)| margin < *m) {
                best_axis = Some((margin, order));
            }
        }
        let order = best_axis.map_or_else(|| (0..n).collect(), |(_, order)| order);

        // Distribution with the least overlap, then the least total area
        let (prefix, suffix) = self.sweeps(bounds, &order);
        let mut split_at = n / 2;
        let mut best = (f64::INFINITY, f64::INFINITY);
        for k in candidates.filter(|k| *k < n) {
            let cost = (
                self.overlap(&prefix[k - 1], &suffix[k]),
                self.area(&prefix[k - 1]) + self.area(&suffix[k]),
            );
            if cost.0 < best.0 || (cost.0 == best.0 && cost.1 < best.1) {
                best = cost;
                split_at = k;
            }
        }
        SplitPlan { order, split_at }
    }

    fn is_ordered(&self) -> bool {
        false
    }

    fn compare_keys(&self, a: &Tuple, b: &Tuple) -> Ordering {
        let width = 2 * self.dimensions;
        let ka = &a.fields()[..width.min(a.len())];
        let kb = &b.fields()[..width.min(b.len())];
        ka.cmp(kb)
    }

    fn bulk_order(&self, a: &Tuple, b: &Tuple) -> Ordering {
        (0..self.dimensions)
            .map(|d| self.center(a, d).total_cmp(&self.center(b, d)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.cmp(b))
    }
}

/// B-tree-like keys: the first `key_fields` fields, compared
/// lexicographically
#[derive(Clone, Debug)]
pub struct OrderedDiscipline {
    key_fields: usize,
    unique: bool,
}

impl OrderedDiscipline {
    #[must_use]
    pub const fn new(key_fields: usize, unique: bool) -> Self {
        Self { key_fields, unique }
    }

    /// Same key semantics without the uniqueness constraint
    #[must_use]
    pub const fn non_unique(&self) -> Self {
        Self {
            key_fields: self.key_fields,
            unique: false,
        }
    }

    fn key<'a>(&self, tuple: &'a Tuple) -> &'a [Field] {
        &tuple.fields()[..self.key_fields.min(tuple.len())]
    }
}

impl KeyDiscipline for OrderedDiscipline {
    fn bound_width(&self) -> usize {
        self.key_fields
    }

    fn validate(&self, tuple: &Tuple) -> Result<()> {
        if tuple.len() < self.key_fields {
            return Err(Error::invalid_tuple(format!(
                "key needs {} fields, tuple has {}",
                self.key_fields,
                tuple.len()
            )));
        }
        if let Some(i) = self.key(tuple).iter().position(|f| !f.is_fixed_width()) {
            return Err(Error::invalid_tuple(format!(
                "key field {i} must be an int or a double"
            )));
        }
        Ok(())
    }

    fn leaf_bound(&self, tuple: &Tuple) -> Result<KeyBound> {
        if tuple.len() < self.key_fields {
            return Err(Error::invalid_tuple("tuple shorter than its key"));
        }
        Ok(KeyBound::point(self.key(tuple).to_vec()))
    }

    fn union(&self, a: &KeyBound, b: &KeyBound) -> KeyBound {
        KeyBound::new(
            a.low.clone().min(b.low.clone()),
            a.high.clone().max(b.high.clone()),
        )
    }

    fn covers(&self, outer: &KeyBound, inner: &KeyBound) -> bool {
        outer.low <= inner.low && inner.high <= outer.high
    }

    fn intersects(&self, a: &KeyBound, b: &KeyBound) -> bool {
        a.low <= b.high && b.low <= a.high
    }

    fn choose_child(&self, children: &[KeyBound], key: &KeyBound) -> usize {
        children
            .partition_point(|child| child.low <= key.low)
            .saturating_sub(1)
    }

    fn split_plan(&self, bounds: &[KeyBound]) -> SplitPlan {
        SplitPlan {
            order: (0..bounds.len()).collect(),
            split_at: bounds.len() / 2,
        }
    }

    fn is_ordered(&self) -> bool {
        true
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn compare_keys(&self, a: &Tuple, b: &Tuple) -> Ordering {
        self.key(a).cmp(self.key(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> KeyBound {
        KeyBound::new(
            vec![Field::Double(x0), Field::Double(y0)],
            vec![Field::Double(x1), Field::Double(y1)],
        )
    }

    #[test]
    fn test_interior_entry_layout() {
        let bound = rect(1.0, 2.0, 3.0, 4.0);
        let tuple = interior_tuple(&bound, PageId::new(17));
        assert_eq!(tuple.len(), 5);
        let (parsed, child) = parse_interior(tuple, 2).unwrap();
        assert_eq!(parsed, bound);
        assert_eq!(child, PageId::new(17));
        assert!(parse_interior(Tuple::ints(&[1, 2]), 2).is_err());
    }

    #[test]
    fn test_spatial_bounds() {
        let spatial = SpatialDiscipline::new(2);
        let a = rect(0.0, 0.0, 1.0, 1.0);
        let b = rect(2.0, 2.0, 3.0, 3.0);
        let u = spatial.union(&a, &b);
        assert_eq!(u, rect(0.0, 0.0, 3.0, 3.0));
        assert!(spatial.covers(&u, &a));
        assert!(!spatial.covers(&a, &u));
        assert!(!spatial.intersects(&a, &b));
        assert!(spatial.intersects(&u, &b));
        // touching boxes intersect
        assert!(spatial.intersects(&a, &rect(1.0, 1.0, 2.0, 2.0)));
    }

    #[test]
    fn test_spatial_validate() {
        let spatial = SpatialDiscipline::new(2);
        assert!(spatial.validate(&Tuple::rect(&[0.0, 0.0], &[1.0, 1.0], 9)).is_ok());
        assert!(spatial.validate(&Tuple::rect(&[2.0, 0.0], &[1.0, 1.0], 9)).is_err());
        assert!(spatial.validate(&Tuple::ints(&[1, 2])).is_err());
        let bound = spatial.leaf_bound(&Tuple::ints(&[1, 2, 3, 4, 5])).unwrap();
        assert_eq!(bound, rect(1.0, 2.0, 3.0, 4.0));
    }

    #[test]
    fn test_spatial_choose_child_least_enlargement() {
        let spatial = SpatialDiscipline::new(2);
        let children = vec![rect(0.0, 0.0, 10.0, 10.0), rect(20.0, 20.0, 21.0, 21.0)];
        assert_eq!(spatial.choose_child(&children, &rect(1.0, 1.0, 2.0, 2.0)), 0);
        assert_eq!(spatial.choose_child(&children, &rect(22.0, 22.0, 22.5, 22.5)), 1);

        // No enlargement needed by either: the smaller child wins
        let nested = vec![rect(0.0, 0.0, 10.0, 10.0), rect(4.0, 4.0, 6.0, 6.0)];
        assert_eq!(spatial.choose_child(&nested, &rect(5.0, 5.0, 5.0, 5.0)), 1);
    }

    #[test]
    fn test_spatial_split_separates_clusters() {
        let spatial = SpatialDiscipline::new(2);
        let mut bounds = Vec::new();
        for i in 0..5 {
            let x = f64::from(i);
            bounds.push(rect(x, 0.0, x + 0.5, 0.5));
            bounds.push(rect(100.0 + x, 0.0, 100.5 + x, 0.5));
        }
        let plan = spatial.split_plan(&bounds);
        assert_eq!(plan.split_at, 5);
        assert_eq!(plan.order.len(), 10);
        let left = union_all(&spatial, plan.order[..5].iter().map(|&i| &bounds[i])).unwrap();
        let right = union_all(&spatial, plan.order[5..].iter().map(|&i| &bounds[i])).unwrap();
        assert!(!spatial.intersects(&left, &right));
    }

    #[test]
    fn test_ordered_discipline() {
        let ordered = OrderedDiscipline::new(1, true);
        assert!(ordered.is_unique());
        assert!(!ordered.non_unique().is_unique());

        let children = vec![
            KeyBound::new(vec![Field::Int(0)], vec![Field::Int(9)]),
            KeyBound::new(vec![Field::Int(10)], vec![Field::Int(19)]),
            KeyBound::new(vec![Field::Int(20)], vec![Field::Int(29)]),
        ];
        let key = |k| KeyBound::point(vec![Field::Int(k)]);
        assert_eq!(ordered.choose_child(&children, &key(-5)), 0);
        assert_eq!(ordered.choose_child(&children, &key(10)), 1);
        assert_eq!(ordered.choose_child(&children, &key(15)), 1);
        assert_eq!(ordered.choose_child(&children, &key(99)), 2);

        let u = ordered.union(&children[0], &children[2]);
        assert!(ordered.covers(&u, &children[1]));
        assert!(ordered.intersects(&children[0], &key(9)));
        assert!(!ordered.intersects(&children[0], &key(10)));
    }

    #[test]
    fn test_ordered_validate_rejects_variable_width_keys() {
        let ordered = OrderedDiscipline::new(1, false);
        let tuple = Tuple::new(vec![Field::Bytes(b"k".to_vec()), Field::Int(1)]);
        assert!(matches!(ordered.validate(&tuple), Err(Error::InvalidTuple(_))));
        let payload = Tuple::new(vec![Field::Int(1), Field::Bytes(b"v".to_vec())]);
        assert!(ordered.validate(&payload).is_ok());
    }

    #[test]
    fn test_predicates() {
        let ordered = OrderedDiscipline::new(1, false);
        let bound = ordered.leaf_bound(&Tuple::ints(&[5, 1])).unwrap();
        assert!(SearchPredicate::All.admits(&ordered, &bound));
        assert!(SearchPredicate::point(vec![Field::Int(5)]).admits(&ordered, &bound));
        assert!(!SearchPredicate::point(vec![Field::Int(6)]).admits(&ordered, &bound));
        assert!(SearchPredicate::range(vec![Field::Int(0)], vec![Field::Int(5)]).admits(&ordered, &bound));
    }
}
