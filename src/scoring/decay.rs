//! Time decay and per-group diminishing returns.

use std::hash::Hash;

use hashbrown::HashMap;

/// Age weighting: `x^-alpha` past the inflection point, `2 - (2 - x)^-alpha` before it.
///
/// `x` is the post age in units of the inflection period. `decay(1) == 1` and the curve is
/// strictly decreasing for `x > 0`.
pub fn decay(x: f64, alpha: f64) -> f64 {
    if x > 1.0 {
        x.powf(-alpha)
    } else {
        2.0 - (2.0 - x).powf(-alpha)
    }
}

/// Halves a score per rank within its group: `score * 2^-k` where `k` is the 0-indexed rank.
///
/// Ranks follow SQL `RANK()`: equal scores share a rank and the next distinct score skips ahead.
/// Items whose key is `None` are left alone.
pub fn rank_decay<T, K, F, S>(items: &mut [T], key: F, score: S)
where
    K: Eq + Hash,
    F: Fn(&T) -> Option<K>,
    S: Fn(&mut T) -> &mut f64,
{
    let mut groups: HashMap<K, Vec<usize>> = HashMap::new();
    for (i, item) in items.iter().enumerate() {
        if let Some(k) = key(item) {
            groups.entry(k).or_default().push(i);
        }
    }

    for (_, mut idx) in groups {
        if idx.len() < 2 {
            continue;
        }
        idx.sort_by(|&a, &b| {
            let sa = *score(&mut items[a]);
            let sb = *score(&mut items[b]);
            sb.total_cmp(&sa)
        });

        let originals: Vec<f64> = idx.iter().map(|&i| *score(&mut items[i])).collect();
        let mut rank = 0usize;
        for (pos, &i) in idx.iter().enumerate() {
            if pos > 0 && originals[pos] < originals[pos - 1] {
                rank = pos;
            }
            *score(&mut items[i]) = originals[pos] * 2f64.powi(-(rank as i32));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_is_one_at_the_inflection_point() {
        assert_eq!(decay(1.0, 1.5), 1.0);
        assert!(decay(0.5, 1.5) > 1.0);
        assert!(decay(2.0, 1.5) < 1.0);
    }

    #[test]
    fn ties_share_a_rank() {
        let mut items = vec![("a", 8.0), ("a", 8.0), ("a", 4.0), ("b", 3.0), ("a", 1.0)];
        rank_decay(&mut items, |t| Some(t.0), |t| &mut t.1);
        assert_eq!(items[0].1, 8.0);
        assert_eq!(items[1].1, 8.0);
        assert_eq!(items[2].1, 1.0);
        assert_eq!(items[3].1, 3.0);
        assert_eq!(items[4].1, 0.125);
    }
}
