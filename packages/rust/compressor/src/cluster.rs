//! Single-link keyword clustering.

use std::collections::BTreeSet;

/// Jaccard similarity of two keyword sets. Two empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Group items whose keyword sets are linked by a chain of pairs with
/// Jaccard similarity `>= threshold`.
///
/// Clusters are returned ordered by their smallest member index; members
/// within a cluster are ascending.
pub fn single_link_clusters(sets: &[BTreeSet<String>], threshold: f64) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..sets.len()).collect();

    for i in 0..sets.len() {
        for j in (i + 1)..sets.len() {
            if jaccard(&sets[i], &sets[j]) >= threshold {
                union(&mut parent, i, j);
            }
        }
    }

    let mut clusters: Vec<Vec<usize>> = Vec::new();
    let mut root_slot: Vec<Option<usize>> = vec![None; sets.len()];
    for i in 0..sets.len() {
        let root = find(&mut parent, i);
        match root_slot[root] {
            Some(slot) => clusters[slot].push(i),
            None => {
                root_slot[root] = Some(clusters.len());
                clusters.push(vec![i]);
            }
        }
    }
    clusters
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        // Smaller index wins so roots stay stable across runs.
        let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[merge] = keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(words: &[&str]) -> BTreeSet<String> {
        words.iter().map(|w| (*w).to_string()).collect()
    }

    #[test]
    fn jaccard_basics() {
        assert_eq!(jaccard(&set(&["a", "b"]), &set(&["a", "b"])), 1.0);
        assert_eq!(jaccard(&set(&["a", "b"]), &set(&["c"])), 0.0);
        assert!((jaccard(&set(&["a", "b", "c"]), &set(&["b", "c", "d"])) - 0.5).abs() < 1e-12);
        assert_eq!(jaccard(&set(&[]), &set(&[])), 0.0);
    }

    #[test]
    fn chains_link_transitively() {
        // 0~1 and 1~2 are similar, 0 and 2 are not: single link joins all three.
        let sets = vec![
            set(&["a", "b", "c"]),
            set(&["b", "c", "d"]),
            set(&["c", "d", "e"]),
            set(&["x", "y"]),
        ];
        let clusters = single_link_clusters(&sets, 0.5);
        assert_eq!(clusters, vec![vec![0, 1, 2], vec![3]]);
    }

    #[test]
    fn singletons_when_nothing_overlaps() {
        let sets = vec![set(&["a"]), set(&["b"]), set(&["c"])];
        assert_eq!(single_link_clusters(&sets, 0.25), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn cluster_order_follows_first_member() {
        let sets = vec![set(&["a"]), set(&["z"]), set(&["a"]), set(&["z"])];
        assert_eq!(single_link_clusters(&sets, 0.9), vec![vec![0, 2], vec![1, 3]]);
    }
}
