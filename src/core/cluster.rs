use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use crate::core::fingerprint::Fingerprint;

/// Threshold scaling reference: user thresholds are calibrated against a 256-bit hash.
pub const REFERENCE_BITS: u32 = 256;

/// Scales a 256-bit calibrated threshold to a hash of `bits` bits, rounded and clamped to `bits`.
pub fn effective_threshold(threshold: u32, bits: u32) -> u32 {
    let scaled = (threshold as f64 * bits as f64 / REFERENCE_BITS as f64).round() as u32;
    scaled.min(bits)
}

/// Set of near-identical files within one album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub members: Vec<String>,
}

impl DuplicateGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.iter().any(|m| m == name)
    }

    /// Whether this group consists of exactly the names in `members`.
    pub fn same_members(&self, members: &BTreeSet<String>) -> bool {
        self.members.len() == members.len() && self.members.iter().all(|m| members.contains(m))
    }
}

/// User decision that a set of files in one album are not duplicates of each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonDuplicateOverride {
    pub album_path: PathBuf,
    pub members: BTreeSet<String>,
}

impl NonDuplicateOverride {
    /// `None` when fewer than two distinct names are given.
    pub fn new<I, S>(album_path: impl Into<PathBuf>, members: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: BTreeSet<String> = members.into_iter().map(Into::into).collect();
        if members.len() < 2 {
            return None;
        }
        Some(Self {
            album_path: album_path.into(),
            members,
        })
    }

    pub fn covers(&self, a: &str, b: &str) -> bool {
        self.members.contains(a) && self.members.contains(b)
    }
}

/// Album file name with its fingerprint, as fed to [`cluster`].
#[derive(Debug, Clone)]
pub struct NamedFingerprint {
    pub name: String,
    pub bits: Fingerprint,
}

impl NamedFingerprint {
    pub fn new(name: impl Into<String>, bits: Fingerprint) -> Self {
        Self {
            name: name.into(),
            bits,
        }
    }
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        // The smaller index stays root so components keep their earliest member as representative.
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[child] = root;
    }
}

/// Groups fingerprints whose Hamming distance is at most `threshold`, transitively.
///
/// Pairs whose names both appear in one override are never linked directly; they can
/// still end up together through a third file that is close to both. Members keep the
/// input order and groups are ordered by their first member.
pub fn cluster(
    fingerprints: &[NamedFingerprint],
    threshold: u32,
    overrides: &[NonDuplicateOverride],
) -> Vec<DuplicateGroup> {
    let n = fingerprints.len();
    if n < 2 {
        return Vec::new();
    }

    let edges: Vec<(usize, usize)> = (0..n)
        .into_par_iter()
        .flat_map_iter(|i| {
            let a = &fingerprints[i];
            (i + 1..n).filter_map(move |j| {
                let b = &fingerprints[j];
                match a.bits.distance(&b.bits) {
                    Some(d) if d <= threshold => Some((i, j)),
                    _ => None,
                }
            })
        })
        .filter(|&(i, j)| {
            let (a, b) = (&fingerprints[i].name, &fingerprints[j].name);
            !overrides.iter().any(|o| o.covers(a, b))
        })
        .collect();

    let mut parent: Vec<usize> = (0..n).collect();
    for (i, j) in edges {
        union(&mut parent, i, j);
    }

    let mut by_root: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        by_root.entry(root).or_default().push(i);
    }

    let mut components: Vec<Vec<usize>> = by_root
        .into_values()
        .filter(|members| members.len() >= 2)
        .collect();
    components.sort_by_key(|members| members[0]);

    let mut groups = Vec::with_capacity(components.len());
    for members in components {
        let mut seen = BTreeSet::new();
        let names: Vec<String> = members
            .into_iter()
            .map(|i| fingerprints[i].name.clone())
            .filter(|name| seen.insert(name.clone()))
            .collect();
        if names.len() >= 2 {
            groups.push(DuplicateGroup { members: names });
        }
    }
    groups
}
