use serde::{Deserialize, Serialize};

pub const CONFLICT_MARKER: &str = "<<<CONFLICT>>>";

/// How overlapping edits are resolved. Disjoint edits are always both kept.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The edit being committed now wins the overlapping region.
    #[default]
    LastWriterWins,
    /// Content already committed by others wins the overlapping region.
    KeepCommitted,
    /// Both versions are kept, separated by `CONFLICT_MARKER`.
    ConflictMarkers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub content: String,
    pub conflicted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Committed,
    Incoming,
}

#[derive(Debug, Clone)]
struct Hunk {
    side: Side,
    start: usize,
    end: usize,
    replacement: Vec<char>,
}

/// Reconcile `incoming` (the client's edit of `base`) with `committed` (what
/// the document holds now, also derived from `base`).
pub fn three_way_merge(
    base: &str,
    committed: &str,
    incoming: &str,
    policy: MergePolicy,
) -> MergeOutcome {
    if incoming == committed || base == incoming {
        return MergeOutcome {
            content: committed.to_string(),
            conflicted: false,
        };
    }
    if base == committed {
        return MergeOutcome {
            content: incoming.to_string(),
            conflicted: false,
        };
    }

    let base: Vec<char> = base.chars().collect();
    let committed: Vec<char> = committed.chars().collect();
    let incoming: Vec<char> = incoming.chars().collect();

    let mut hunks = diff_hunks(&base, &committed, Side::Committed);
    hunks.extend(diff_hunks(&base, &incoming, Side::Incoming));
    hunks.sort_by_key(|h| (h.start, h.end));

    let mut out = Vec::with_capacity(base.len().max(incoming.len()));
    let mut conflicted = false;
    let mut cursor = 0;
    let mut i = 0;

    while i < hunks.len() {
        let group_start = hunks[i].start;
        let mut group_end = hunks[i].end;
        let mut j = i + 1;
        while j < hunks.len() && overlaps(group_start, group_end, &hunks[j]) {
            group_end = group_end.max(hunks[j].end);
            j += 1;
        }
        let group = &hunks[i..j];

        out.extend_from_slice(&base[cursor..group_start]);

        let committed_text = render_side(&base, group_start, group_end, group, Side::Committed);
        let incoming_text = render_side(&base, group_start, group_end, group, Side::Incoming);
        let touched_both = group.iter().any(|h| h.side == Side::Committed)
            && group.iter().any(|h| h.side == Side::Incoming);

        if !touched_both || committed_text == incoming_text {
            let text = if group.iter().any(|h| h.side == Side::Incoming) {
                incoming_text
            } else {
                committed_text
            };
            out.extend(text);
        } else {
            conflicted = true;
            match policy {
                MergePolicy::LastWriterWins => out.extend(incoming_text),
                MergePolicy::KeepCommitted => out.extend(committed_text),
                MergePolicy::ConflictMarkers => {
                    out.extend(committed_text);
                    out.push('\n');
                    out.extend(CONFLICT_MARKER.chars());
                    out.push('\n');
                    out.extend(incoming_text);
                }
            }
        }

        cursor = group_end;
        i = j;
    }
    out.extend_from_slice(&base[cursor..]);

    MergeOutcome {
        content: out.into_iter().collect(),
        conflicted,
    }
}

fn overlaps(group_start: usize, group_end: usize, hunk: &Hunk) -> bool {
    let intersects = hunk.start < group_end && group_start < hunk.end;
    let same_insertion_point = group_start == group_end
        && hunk.start == hunk.end
        && hunk.start == group_start;
    intersects || same_insertion_point
}

fn render_side(base: &[char], start: usize, end: usize, group: &[Hunk], side: Side) -> Vec<char> {
    let mut text = Vec::new();
    let mut cursor = start;
    for hunk in group.iter().filter(|h| h.side == side) {
        text.extend_from_slice(&base[cursor..hunk.start]);
        text.extend_from_slice(&hunk.replacement);
        cursor = hunk.end;
    }
    text.extend_from_slice(&base[cursor..end]);
    text
}

/// Upper bound on diagonal steps spent diffing one side against the base.
/// Past it the remaining changed span is reported as a single hunk.
const DIFF_BUDGET: usize = 1 << 22;

fn diff_hunks(base: &[char], other: &[char], side: Side) -> Vec<Hunk> {
    let mut differ = Differ::new(base, other, DIFF_BUDGET);
    differ.diff(0, base.len(), 0, other.len());

    let mut hunks = Vec::new();
    let (mut i, mut j) = (0, 0);
    for (mi, mj) in differ
        .matches
        .into_iter()
        .chain(std::iter::once((base.len(), other.len())))
    {
        if mi > i || mj > j {
            hunks.push(Hunk {
                side,
                start: i,
                end: mi,
                replacement: other[j..mj].to_vec(),
            });
        }
        i = mi + 1;
        j = mj + 1;
    }
    hunks
}

/// Linear-space Myers diff: finds the middle snake of each range and
/// recurses on both halves, collecting matching index pairs in order.
struct Differ<'a> {
    a: &'a [char],
    b: &'a [char],
    budget: usize,
    matches: Vec<(usize, usize)>,
}

impl<'a> Differ<'a> {
    fn new(a: &'a [char], b: &'a [char], budget: usize) -> Self {
        Self {
            a,
            b,
            budget,
            matches: Vec::new(),
        }
    }

    fn diff(&mut self, mut a_lo: usize, mut a_hi: usize, mut b_lo: usize, mut b_hi: usize) {
        while a_lo < a_hi && b_lo < b_hi && self.a[a_lo] == self.b[b_lo] {
            self.matches.push((a_lo, b_lo));
            a_lo += 1;
            b_lo += 1;
        }
        let mut tail = Vec::new();
        while a_lo < a_hi && b_lo < b_hi && self.a[a_hi - 1] == self.b[b_hi - 1] {
            a_hi -= 1;
            b_hi -= 1;
            tail.push((a_hi, b_hi));
        }

        if a_lo < a_hi && b_lo < b_hi {
            if let Some((x, y)) = self.bisect(a_lo, a_hi, b_lo, b_hi) {
                self.diff(a_lo, x, b_lo, y);
                self.diff(x, a_hi, y, b_hi);
            }
        }
        self.matches.extend(tail.into_iter().rev());
    }

    fn spend(&mut self, steps: usize) -> bool {
        if self.budget < steps {
            self.budget = 0;
            return false;
        }
        self.budget -= steps;
        true
    }

    /// Split point of the middle snake, or `None` when the budget runs out.
    fn bisect(&mut self, a_lo: usize, a_hi: usize, b_lo: usize, b_hi: usize) -> Option<(usize, usize)> {
        let n = (a_hi - a_lo) as isize;
        let m = (b_hi - b_lo) as isize;
        let max_d = (n + m + 1) / 2;
        let offset = max_d;
        let len = (2 * max_d + 2) as usize;
        let mut v1 = vec![-1isize; len];
        let mut v2 = vec![-1isize; len];
        v1[(offset + 1) as usize] = 0;
        v2[(offset + 1) as usize] = 0;

        let delta = n - m;
        let front = delta % 2 != 0;
        let (mut k1_start, mut k1_end, mut k2_start, mut k2_end) = (0, 0, 0, 0);

        for d in 0..max_d {
            let mut k1 = -d + k1_start;
            while k1 <= d - k1_end {
                let idx = (offset + k1) as usize;
                let mut x1 = if k1 == -d || (k1 != d && v1[idx - 1] < v1[idx + 1]) {
                    v1[idx + 1]
                } else {
                    v1[idx - 1] + 1
                };
                let mut y1 = x1 - k1;
                let from = x1;
                while x1 < n && y1 < m && self.a[a_lo + x1 as usize] == self.b[b_lo + y1 as usize] {
                    x1 += 1;
                    y1 += 1;
                }
                if !self.spend(1 + (x1 - from) as usize) {
                    return None;
                }
                v1[idx] = x1;
                if x1 > n {
                    k1_end += 2;
                } else if y1 > m {
                    k1_start += 2;
                } else if front {
                    let k2 = offset + delta - k1;
                    if k2 >= 0 && (k2 as usize) < len && v2[k2 as usize] != -1 {
                        let x2 = n - v2[k2 as usize];
                        if x1 >= x2 {
                            return self.split(a_lo, a_hi, b_lo, b_hi, x1, y1);
                        }
                    }
                }
                k1 += 2;
            }

            let mut k2 = -d + k2_start;
            while k2 <= d - k2_end {
                let idx = (offset + k2) as usize;
                let mut x2 = if k2 == -d || (k2 != d && v2[idx - 1] < v2[idx + 1]) {
                    v2[idx + 1]
                } else {
                    v2[idx - 1] + 1
                };
                let mut y2 = x2 - k2;
                let from = x2;
                while x2 < n
                    && y2 < m
                    && self.a[a_lo + (n - x2 - 1) as usize] == self.b[b_lo + (m - y2 - 1) as usize]
                {
                    x2 += 1;
                    y2 += 1;
                }
                if !self.spend(1 + (x2 - from) as usize) {
                    return None;
                }
                v2[idx] = x2;
                if x2 > n {
                    k2_end += 2;
                } else if y2 > m {
                    k2_start += 2;
                } else if !front {
                    let k1 = offset + delta - k2;
                    if k1 >= 0 && (k1 as usize) < len && v1[k1 as usize] != -1 {
                        let x1 = v1[k1 as usize];
                        let y1 = offset + x1 - k1;
                        if x1 >= n - x2 {
                            return self.split(a_lo, a_hi, b_lo, b_hi, x1, y1);
                        }
                    }
                }
                k2 += 2;
            }
        }
        None
    }

    fn split(
        &self,
        a_lo: usize,
        a_hi: usize,
        b_lo: usize,
        b_hi: usize,
        x: isize,
        y: isize,
    ) -> Option<(usize, usize)> {
        let (x, y) = (a_lo + x as usize, b_lo + y as usize);
        if (x, y) == (a_lo, b_lo) || (x, y) == (a_hi, b_hi) {
            return None;
        }
        Some((x, y))
    }
}
