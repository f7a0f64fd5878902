//! Longest-matching-block sequence comparison.
//!
//! Finds the longest contiguous matching run, then recurses on the pieces
//! to its left and right. The resulting matching blocks are turned into
//! edit opcodes. Works over any slice of hashable items (word tokens for
//! text diffs, label strings for relation diffs).

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Edit operation between two sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpTag {
    Equal,
    Insert,
    Delete,
    Replace,
}

impl OpTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "equal",
            Self::Insert => "insert",
            Self::Delete => "delete",
            Self::Replace => "replace",
        }
    }
}

/// `a[a_range]` becomes `b[b_range]` via `tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opcode {
    pub tag: OpTag,
    pub a_range: Range<usize>,
    pub b_range: Range<usize>,
}

/// A run of `size` equal items starting at `a[a]` and `b[b]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Block {
    a: usize,
    b: usize,
    size: usize,
}

struct Matcher<'s, T> {
    a: &'s [T],
    b_index: HashMap<&'s T, Vec<usize>>,
}

impl<'s, T: Eq + Hash> Matcher<'s, T> {
    fn new(a: &'s [T], b: &'s [T]) -> Self {
        let mut b_index: HashMap<&T, Vec<usize>> = HashMap::new();
        for (j, item) in b.iter().enumerate() {
            b_index.entry(item).or_default().push(j);
        }
        Self { a, b_index }
    }

    /// Longest matching block in `a[alo..ahi]` and `b[blo..bhi]`.
    ///
    /// Ties go to the block starting earliest in `a`, then earliest in `b`.
    fn longest_match(&self, alo: usize, ahi: usize, blo: usize, bhi: usize) -> Block {
        let mut best = Block {
            a: alo,
            b: blo,
            size: 0,
        };
        let mut run_ending_at: HashMap<usize, usize> = HashMap::new();

        for i in alo..ahi {
            let mut next_runs: HashMap<usize, usize> = HashMap::new();
            if let Some(positions) = self.b_index.get(&self.a[i]) {
                for &j in positions {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let prev = j
                        .checked_sub(1)
                        .and_then(|pj| run_ending_at.get(&pj))
                        .copied()
                        .unwrap_or(0);
                    let k = prev + 1;
                    next_runs.insert(j, k);
                    if k > best.size {
                        best = Block {
                            a: i + 1 - k,
                            b: j + 1 - k,
                            size: k,
                        };
                    }
                }
            }
            run_ending_at = next_runs;
        }
        best
    }

    fn matching_blocks(&self, a_len: usize, b_len: usize) -> Vec<Block> {
        let mut pending = vec![(0, a_len, 0, b_len)];
        let mut blocks = Vec::new();

        while let Some((alo, ahi, blo, bhi)) = pending.pop() {
            let m = self.longest_match(alo, ahi, blo, bhi);
            if m.size == 0 {
                continue;
            }
            blocks.push(m);
            if alo < m.a && blo < m.b {
                pending.push((alo, m.a, blo, m.b));
            }
            if m.a + m.size < ahi && m.b + m.size < bhi {
                pending.push((m.a + m.size, ahi, m.b + m.size, bhi));
            }
        }
        blocks.sort();

        // Collapse adjacent blocks.
        let mut merged: Vec<Block> = Vec::with_capacity(blocks.len() + 1);
        for block in blocks {
            match merged.last_mut() {
                Some(last) if last.a + last.size == block.a && last.b + last.size == block.b => {
                    last.size += block.size;
                }
                _ => merged.push(block),
            }
        }
        merged.push(Block {
            a: a_len,
            b: b_len,
            size: 0,
        });
        merged
    }
}

/// Compute the opcodes turning `a` into `b`.
pub fn opcodes<T: Eq + Hash>(a: &[T], b: &[T]) -> Vec<Opcode> {
    let matcher = Matcher::new(a, b);
    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);

    for block in matcher.matching_blocks(a.len(), b.len()) {
        let tag = match (i < block.a, j < block.b) {
            (true, true) => Some(OpTag::Replace),
            (true, false) => Some(OpTag::Delete),
            (false, true) => Some(OpTag::Insert),
            (false, false) => None,
        };
        if let Some(tag) = tag {
            ops.push(Opcode {
                tag,
                a_range: i..block.a,
                b_range: j..block.b,
            });
        }
        i = block.a + block.size;
        j = block.b + block.size;
        if block.size > 0 {
            ops.push(Opcode {
                tag: OpTag::Equal,
                a_range: block.a..i,
                b_range: block.b..j,
            });
        }
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(ops: &[Opcode]) -> Vec<OpTag> {
        ops.iter().map(|o| o.tag).collect()
    }

    #[test]
    fn identical_sequences_are_one_equal_run() {
        let a = ["a", "b", "c"];
        let ops = opcodes(&a, &a);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].tag, OpTag::Equal);
        assert_eq!(ops[0].a_range, 0..3);
    }

    #[test]
    fn empty_inputs_produce_no_ops() {
        let empty: [&str; 0] = [];
        assert!(opcodes(&empty, &empty).is_empty());
    }

    #[test]
    fn insert_into_empty() {
        let empty: [&str; 0] = [];
        let ops = opcodes(&empty, &["x", "y"]);
        assert_eq!(tags(&ops), vec![OpTag::Insert]);
        assert_eq!(ops[0].b_range, 0..2);
    }

    #[test]
    fn replace_in_middle() {
        let a = ["Old", " ", "Title"];
        let b = ["New", " ", "Title"];
        let ops = opcodes(&a, &b);
        assert_eq!(tags(&ops), vec![OpTag::Replace, OpTag::Equal]);
        assert_eq!(ops[0].a_range, 0..1);
        assert_eq!(ops[1].a_range, 1..3);
    }

    #[test]
    fn delete_and_insert() {
        let a = ["a", "b", "c", "d"];
        let b = ["a", "c", "d", "e"];
        let ops = opcodes(&a, &b);
        assert_eq!(
            tags(&ops),
            vec![OpTag::Equal, OpTag::Delete, OpTag::Equal, OpTag::Insert]
        );
        assert_eq!(ops[1].a_range, 1..2);
        assert_eq!(ops[3].b_range, 3..4);
    }

    #[test]
    fn opcodes_cover_both_sequences() {
        let a: Vec<char> = "the quick brown fox".chars().collect();
        let b: Vec<char> = "the quack brown box!".chars().collect();
        let ops = opcodes(&a, &b);
        assert_eq!(ops.first().unwrap().a_range.start, 0);
        assert_eq!(ops.last().unwrap().a_range.end, a.len());
        assert_eq!(ops.last().unwrap().b_range.end, b.len());
        for pair in ops.windows(2) {
            assert_eq!(pair[0].a_range.end, pair[1].a_range.start);
            assert_eq!(pair[0].b_range.end, pair[1].b_range.start);
        }
    }
}
