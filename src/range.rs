// Copyright 2023 The SeamDB Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Key range and region arithmetic for the sharded key space.

use std::cmp::Ordering::{self, *};
use std::collections::hash_map::DefaultHasher;
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};

pub type Key = Vec<u8>;

/// Exclusive upper bound of a key range: a key or positive infinity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RightBound(Option<Key>);

impl RightBound {
    pub fn unbounded() -> Self {
        Self(None)
    }

    pub fn key(key: impl Into<Key>) -> Self {
        Self(Some(key.into()))
    }

    pub fn is_unbounded(&self) -> bool {
        self.0.is_none()
    }

    pub fn as_key(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }

    /// Whether `key` lies strictly beneath this bound.
    pub fn admits(&self, key: &[u8]) -> bool {
        match &self.0 {
            None => true,
            Some(end) => key < end.as_slice(),
        }
    }
}

impl Ord for RightBound {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (None, None) => Equal,
            (None, Some(_)) => Greater,
            (Some(_), None) => Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for RightBound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Debug for RightBound {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => f.write_str("+inf"),
            Some(key) => write!(f, "{key:?}"),
        }
    }
}

/// Half-open key range `[start, end)`. The empty key is the smallest key,
/// so `start = []` means the range is left-unbounded.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub start: Key,
    pub end: RightBound,
}

impl KeyRange {
    pub fn new(start: impl Into<Key>, end: RightBound) -> Self {
        Self { start: start.into(), end }
    }

    pub fn universe() -> Self {
        Self { start: Key::default(), end: RightBound::unbounded() }
    }

    pub fn empty() -> Self {
        Self { start: Key::default(), end: RightBound::key(Key::default()) }
    }

    pub fn is_empty(&self) -> bool {
        match self.end.as_key() {
            None => false,
            Some(end) => end <= self.start.as_slice(),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && self.end.admits(key)
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.is_empty() || (other.start.as_slice() >= self.start.as_slice() && other.end <= self.end)
    }

    pub fn intersect(&self, other: &KeyRange) -> KeyRange {
        let start = self.start.as_slice().max(other.start.as_slice()).to_vec();
        let end = self.end.clone().min(other.end.clone());
        KeyRange { start, end }
    }
}

impl Debug for KeyRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.start, self.end)
    }
}

/// Half-open range over the 64 bit key hash space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HashRange {
    pub beg: u64,
    pub end: u64,
}

impl HashRange {
    pub fn universe() -> Self {
        Self { beg: 0, end: u64::MAX }
    }

    pub fn is_empty(&self) -> bool {
        self.beg >= self.end
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.beg <= hash && hash < self.end
    }
}

/// Hashes a key into the shard hash space. The result never reaches
/// `u64::MAX` so the universe hash range covers every key.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    match hasher.finish() {
        u64::MAX => 0,
        hash => hash,
    }
}

/// A rectangle of the keyspace: a hash shard range crossed with a key range.
/// Region ordering and partition arithmetic operate on the key range only;
/// the hash range is fixed across one replica.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub hash: HashRange,
    pub keys: KeyRange,
}

impl Region {
    pub fn new(hash: HashRange, keys: KeyRange) -> Self {
        Self { hash, keys }
    }

    pub fn universe() -> Self {
        Self { hash: HashRange::universe(), keys: KeyRange::universe() }
    }

    /// An empty region sharing `self`'s hash range.
    pub fn to_empty(&self) -> Self {
        Self { hash: self.hash, keys: KeyRange::empty() }
    }

    pub fn is_empty(&self) -> bool {
        self.hash.is_empty() || self.keys.is_empty()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.keys.contains_key(key) && self.hash.contains(hash_key(key))
    }

    pub fn contains(&self, other: &Region) -> bool {
        other.is_empty() || (self.hash == other.hash && self.keys.contains_range(&other.keys))
    }

    pub fn with_keys(&self, keys: KeyRange) -> Self {
        Self { hash: self.hash, keys }
    }

    pub fn intersect(&self, other: &Region) -> Region {
        assert_eq!(self.hash, other.hash, "regions from different hash shards");
        self.with_keys(self.keys.intersect(&other.keys))
    }
}

impl Debug for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:#x}..{:#x}, {:?}}}", self.hash.beg, self.hash.end, self.keys)
    }
}

/// Ordered map from contiguous key sub-ranges of one region to values.
/// Segments are sorted ascending and cover the domain without gaps.
#[derive(Clone, PartialEq)]
pub struct RegionMap<T> {
    hash: HashRange,
    entries: Vec<(KeyRange, T)>,
}

impl<T: Clone> RegionMap<T> {
    pub fn new(domain: Region, value: T) -> Self {
        assert!(!domain.is_empty(), "region map over empty domain");
        Self { hash: domain.hash, entries: vec![(domain.keys, value)] }
    }

    pub fn domain(&self) -> Region {
        let start = self.entries.first().unwrap().0.start.clone();
        let end = self.entries.last().unwrap().0.end.clone();
        Region { hash: self.hash, keys: KeyRange { start, end } }
    }

    pub fn lookup(&self, key: &[u8]) -> &T {
        let i = self.entries.partition_point(|(range, _)| !range.end.admits(key));
        let (range, value) = self.entries.get(i).unwrap_or_else(|| panic!("key {key:?} beyond map domain"));
        assert!(range.contains_key(key), "key {key:?} beneath map domain");
        value
    }

    /// Overwrites `region` with `value`, splitting boundary segments.
    /// `region` must lie inside the domain.
    pub fn update(&mut self, region: &Region, value: T) {
        if region.is_empty() {
            return;
        }
        assert_eq!(self.hash, region.hash, "update from different hash shard");
        assert!(self.domain().contains(region), "update region {region:?} beyond domain {:?}", self.domain());
        let target = &region.keys;
        let mut entries = Vec::with_capacity(self.entries.len() + 2);
        for (range, old) in self.entries.drain(..) {
            if range.intersect(target).is_empty() {
                entries.push((range, old));
                continue;
            }
            if range.start < target.start {
                entries.push((KeyRange::new(range.start.clone(), RightBound::key(target.start.clone())), old.clone()));
            }
            if let Some(end) = target.end.as_key() {
                if RightBound::key(end.to_vec()) < range.end {
                    entries.push((KeyRange::new(end.to_vec(), range.end), old));
                }
            }
        }
        entries.push((target.clone(), value));
        entries.sort_by(|(a, _), (b, _)| a.start.cmp(&b.start));
        self.entries = entries;
    }

    /// Visits segments intersecting `region` in ascending key order,
    /// clipped to it.
    pub fn visit(&self, region: &Region, mut f: impl FnMut(&Region, &T)) {
        for (range, value) in &self.entries {
            let clipped = range.intersect(&region.keys);
            if !clipped.is_empty() {
                f(&Region { hash: self.hash, keys: clipped }, value);
            }
        }
    }

    /// The sub-map covering `region`.
    pub fn clip(&self, region: &Region) -> RegionMap<T> {
        let mut entries = Vec::new();
        self.visit(region, |region, value| entries.push((region.keys.clone(), value.clone())));
        assert!(!entries.is_empty(), "clip region {region:?} outside domain {:?}", self.domain());
        RegionMap { hash: self.hash, entries }
    }

    pub fn map<U: Clone>(&self, f: impl Fn(&T) -> U) -> RegionMap<U> {
        let entries = self.entries.iter().map(|(range, value)| (range.clone(), f(value))).collect();
        RegionMap { hash: self.hash, entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Region, &T)> + '_ {
        self.entries.iter().map(|(range, value)| (Region { hash: self.hash, keys: range.clone() }, value))
    }
}

impl<T: Debug> Debug for RegionMap<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter().map(|(range, value)| (range, value))).finish()
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    fn range(start: &[u8], end: &[u8]) -> KeyRange {
        KeyRange::new(start.to_vec(), RightBound::key(end.to_vec()))
    }

    #[test]
    fn test_right_bound_order() {
        assert_that!(RightBound::key(b"a".to_vec())).is_less_than(RightBound::key(b"b".to_vec()));
        assert_that!(RightBound::key(b"z".to_vec())).is_less_than(RightBound::unbounded());
        assert_that!(RightBound::unbounded() < RightBound::unbounded()).is_false();
    }

    #[test]
    fn test_key_range() {
        let universe = KeyRange::universe();
        assert_that!(universe.is_empty()).is_false();
        assert_that!(universe.contains_key(b"")).is_true();
        assert_that!(universe.contains_key(b"zzz")).is_true();

        assert_that!(KeyRange::empty().is_empty()).is_true();

        let bc = range(b"b", b"c");
        assert_that!(bc.contains_key(b"a")).is_false();
        assert_that!(bc.contains_key(b"b")).is_true();
        assert_that!(bc.contains_key(b"bz")).is_true();
        assert_that!(bc.contains_key(b"c")).is_false();

        assert_that!(universe.contains_range(&bc)).is_true();
        assert_that!(bc.contains_range(&universe)).is_false();
        assert_that!(bc.contains_range(&KeyRange::empty())).is_true();

        assert_that!(range(b"a", b"d").intersect(&range(b"b", b"f"))).is_equal_to(range(b"b", b"d"));
        assert_that!(range(b"a", b"b").intersect(&range(b"c", b"d")).is_empty()).is_true();
    }

    #[test]
    fn test_region_contains() {
        let region = Region::new(HashRange::universe(), range(b"a", b"m"));
        assert_that!(region.contains_key(b"c")).is_true();
        assert_that!(region.contains_key(b"m")).is_false();
        assert_that!(region.contains(&region.to_empty())).is_true();
        assert_that!(region.to_empty().is_empty()).is_true();

        let narrow = Region::new(HashRange { beg: 0, end: 1 }, range(b"a", b"m"));
        assert_that!(narrow.contains_key(b"c") && narrow.contains_key(b"d")).is_false();
    }

    #[test]
    fn test_region_map_update() {
        let domain = Region::new(HashRange::universe(), range(b"a", b"z"));
        let mut map = RegionMap::new(domain.clone(), 0);
        assert_that!(*map.lookup(b"q")).is_equal_to(0);

        map.update(&domain.with_keys(range(b"c", b"f")), 1);
        assert_that!(*map.lookup(b"a")).is_equal_to(0);
        assert_that!(*map.lookup(b"c")).is_equal_to(1);
        assert_that!(*map.lookup(b"e")).is_equal_to(1);
        assert_that!(*map.lookup(b"f")).is_equal_to(0);

        map.update(&domain.with_keys(range(b"d", b"g")), 2);
        assert_that!(*map.lookup(b"c")).is_equal_to(1);
        assert_that!(*map.lookup(b"d")).is_equal_to(2);
        assert_that!(*map.lookup(b"f")).is_equal_to(2);
        assert_that!(*map.lookup(b"g")).is_equal_to(0);

        assert_that!(map.domain()).is_equal_to(domain.clone());

        let mut visited = Vec::new();
        map.visit(&domain.with_keys(range(b"b", b"e")), |region, value| {
            visited.push((region.keys.clone(), *value));
        });
        assert_that!(visited).is_equal_to(vec![(range(b"b", b"c"), 0), (range(b"c", b"d"), 1), (range(b"d", b"e"), 2)]);

        map.update(&domain.to_empty(), 9);
        assert_that!(*map.lookup(b"d")).is_equal_to(2);
    }

    #[test]
    fn test_region_map_clip() {
        let domain = Region::new(HashRange::universe(), range(b"a", b"z"));
        let mut map = RegionMap::new(domain.clone(), 0);
        map.update(&domain.with_keys(range(b"c", b"f")), 1);

        let clipped = map.clip(&domain.with_keys(range(b"b", b"d")));
        assert_that!(clipped.domain().keys).is_equal_to(range(b"b", b"d"));
        assert_that!(*clipped.lookup(b"b")).is_equal_to(0);
        assert_that!(*clipped.lookup(b"c")).is_equal_to(1);
    }

    #[test]
    #[should_panic(expected = "beyond domain")]
    fn test_region_map_update_beyond_domain() {
        let domain = Region::new(HashRange::universe(), range(b"c", b"f"));
        let mut map = RegionMap::new(domain.clone(), 0);
        map.update(&domain.with_keys(range(b"a", b"d")), 1);
    }
}
