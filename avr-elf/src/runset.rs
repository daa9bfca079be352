//! Run-compressed boolean sets over `u32` positions
//!
//! A [`RunSet`] stores a sparse boolean function as its transition points.
//! `runs` is a strictly increasing list of positions where the value flips;
//! `first_value` is the value of the run starting at `runs[0]` (always 0).
//! The set implicitly continues with `false` past the last transition, so
//! when `first_value` is false the list has an odd number of entries, and an
//! even number when it is true.
//!
//! Example: `set(3, 6)` then `set(10, 13)` yields `first_value = false`,
//! `runs = [0, 3, 7, 10, 14]`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseRunSetError {
    #[error("expected a whitespace-separated list of decimal integers")]
    BadToken,
    #[error("missing first-run value, last transition, or deltas")]
    TooShort,
    #[error("run count parity does not match the first-run value")]
    BadParity,
    #[error("delta sum does not match the declared last transition")]
    BadChecksum,
}

/// Set of `u32` positions stored as alternating true/false runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSet {
    first_value: bool,
    runs: Vec<u32>,
}

impl Default for RunSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSet {
    /// Creates an empty set: a single transition at 0 with value false.
    pub fn new() -> Self {
        RunSet {
            first_value: false,
            runs: vec![0],
        }
    }

    /// Value of the run that starts at `runs[0]`.
    pub fn first_value(&self) -> bool {
        self.first_value
    }

    /// The raw transition points. `runs()[0]` is always 0.
    pub fn runs(&self) -> &[u32] {
        &self.runs
    }

    /// The last transition point (one past the largest member, or 0 when
    /// the set is empty).
    pub fn max(&self) -> u32 {
        self.runs.last().copied().unwrap_or(0)
    }

    /// The smallest member, or 0 when the set is empty.
    pub fn min(&self) -> u32 {
        if self.first_value {
            self.runs[0]
        } else {
            self.runs.get(1).copied().unwrap_or(0)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.runs.len() == 1
    }

    /// Number of members.
    pub fn count(&self) -> u32 {
        self.true_runs().map(|(s, e)| e - s).sum()
    }

    /// Index of the run containing `pos`. Positions past the last
    /// transition land in the implicit trailing false run.
    fn run_index(&self, pos: u32) -> usize {
        // runs[0] == 0, so at least one entry is <= pos.
        self.runs.partition_point(|&r| r <= pos).saturating_sub(1)
    }

    /// Value of the run at `run_index`; runs alternate by construction.
    fn run_value(&self, run_index: usize) -> bool {
        self.first_value != (run_index & 1 == 1)
    }

    /// Membership test, O(log R) for R runs.
    pub fn contains(&self, pos: u32) -> bool {
        self.run_value(self.run_index(pos))
    }

    /// The true runs as half-open `(start, end)` ranges in ascending order.
    pub fn true_runs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let skip = usize::from(!self.first_value);
        self.runs[skip..].chunks_exact(2).map(|pair| (pair[0], pair[1]))
    }

    /// Marks every position in `[start, end)` with `value`.
    ///
    /// `start >= end` is a no-op, as is clearing past the current maximum
    /// (the implicit tail is already false). Setting true past the maximum
    /// appends a trailing run; otherwise the boundary transitions are
    /// located by binary search and inserted, removed, or merged in place.
    pub fn set_run(&mut self, start: u32, end: u32, value: bool) {
        if start >= end {
            return;
        }
        if start > self.max() {
            if value {
                self.runs.push(start);
                self.runs.push(end);
            }
            return;
        }
        if !value && end <= self.min() {
            return;
        }
        let left = self.run_index(start);
        let right = self.run_index(end);
        if left < right {
            let mut remove_end = right;
            if self.run_value(right) != value {
                self.runs[remove_end] = end;
            } else {
                remove_end += 1;
            }
            let mut remove_start = left + 1;
            if self.run_value(left) != value {
                if start == 0 {
                    // A transition at 0 is represented by flipping the
                    // first-run value, never by inserting a point.
                    self.first_value = !self.first_value;
                } else if self.runs[left] != start {
                    self.runs[remove_start] = start;
                    remove_start += 1;
                } else {
                    remove_start -= 1;
                }
            }
            if remove_end > remove_start {
                self.runs.drain(remove_start..remove_end);
            }
        } else if self.run_value(left) != value {
            // start and end fall inside the same run
            if start == 0 {
                self.first_value = !self.first_value;
                self.runs.insert(left + 1, end);
            } else if self.runs[left] != start {
                self.runs.insert(left + 1, end);
                self.runs.insert(left + 1, start);
            } else {
                self.runs[left] = end;
            }
        }
    }

    /// Marks the inclusive range `[from, to]` as members.
    pub fn set(&mut self, from: u32, to: u32) {
        self.set_run(from, to.saturating_add(1), true);
    }

    /// Removes the inclusive range `[from, to]`.
    pub fn clear(&mut self, from: u32, to: u32) {
        self.set_run(from, to.saturating_add(1), false);
    }

    /// Resets to the empty set.
    pub fn clear_all(&mut self) {
        self.first_value = false;
        self.runs.clear();
        self.runs.push(0);
    }

    /// Adds every member of `other`.
    pub fn union(&mut self, other: &RunSet) {
        for (s, e) in other.true_runs() {
            self.set_run(s, e, true);
        }
    }

    /// Removes every member of `other`; returns true when the result is
    /// empty.
    pub fn diff(&mut self, other: &RunSet) -> bool {
        for (s, e) in other.true_runs() {
            self.set_run(s, e, false);
        }
        self.is_empty()
    }

    /// Keeps only members also present in `other`; returns true when the
    /// result is empty.
    pub fn sect(&mut self, other: &RunSet) -> bool {
        let mut prev = 0u32;
        for (s, e) in other.true_runs() {
            if s > prev {
                self.set_run(prev, s, false);
            }
            prev = e;
        }
        self.set_run(prev, u32::MAX, false);
        self.is_empty()
    }

    /// Rank: the ordinal of `pos` among the members, or `None` when `pos`
    /// is not a member.
    pub fn index_number(&self, pos: u32) -> Option<u32> {
        let mut n = 0u32;
        for (s, e) in self.true_runs() {
            if pos < s {
                break;
            }
            if pos < e {
                return Some(n + (pos - s));
            }
            n += e - s;
        }
        None
    }

    /// Select: the n-th member in ascending order, clamped to the largest
    /// member when `n` is out of range.
    pub fn nth_index(&self, n: u32) -> u32 {
        let mut passed = 0u32;
        for (s, e) in self.true_runs() {
            let len = e - s;
            if n < passed + len {
                return s + (n - passed);
            }
            passed += len;
        }
        self.max().saturating_sub(1)
    }
}

/// Serializes as `firstRunValue lastTransition delta0 delta1 ...`, each
/// delta the distance from the previous transition. The last transition is
/// repeated up front as a checksum.
impl fmt::Display for RunSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", u8::from(self.first_value), self.max())?;
        let mut prev = 0u32;
        for &r in &self.runs {
            write!(f, " {}", r - prev)?;
            prev = r;
        }
        Ok(())
    }
}

impl FromStr for RunSet {
    type Err = ParseRunSetError;

    /// Parses the [`Display`] grammar. The parity invariant, the leading
    /// transition at 0, and the delta checksum are all validated before a
    /// value is produced, so corrupt input never yields a partial set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        let first_value = tokens
            .next()
            .ok_or(ParseRunSetError::TooShort)?
            .parse::<u32>()
            .map_err(|_| ParseRunSetError::BadToken)?
            != 0;
        let declared_last = tokens
            .next()
            .ok_or(ParseRunSetError::TooShort)?
            .parse::<u32>()
            .map_err(|_| ParseRunSetError::BadToken)?;

        let mut runs = Vec::new();
        let mut pos = 0u32;
        for token in tokens {
            let delta = token
                .parse::<u32>()
                .map_err(|_| ParseRunSetError::BadToken)?;
            pos = pos.checked_add(delta).ok_or(ParseRunSetError::BadChecksum)?;
            runs.push(pos);
        }

        if runs.is_empty() {
            return Err(ParseRunSetError::TooShort);
        }
        if runs[0] != 0 || !runs.windows(2).all(|w| w[0] < w[1]) {
            return Err(ParseRunSetError::BadChecksum);
        }
        if pos != declared_last {
            return Err(ParseRunSetError::BadChecksum);
        }
        if first_value == (runs.len() & 1 == 1) {
            return Err(ParseRunSetError::BadParity);
        }
        Ok(RunSet { first_value, runs })
    }
}

/// Cursor over the members of a [`RunSet`], one position at a time.
///
/// The cursor borrows the set, so the set cannot change underneath it.
/// Every move records the prior position as "last current" so callers can
/// diff before/after cheaply.
pub struct RunCursor<'a> {
    set: &'a RunSet,
    wrap: bool,
    /// Index of the transition ending the current run.
    current_run: usize,
    run_start: u32,
    run_end: u32,
    current: Option<u32>,
    last_current: Option<u32>,
}

impl<'a> RunCursor<'a> {
    /// Cursor positioned at the first member; `next`/`previous` stop at the
    /// set boundaries.
    pub fn new(set: &'a RunSet) -> Self {
        Self::with_wrap(set, false)
    }

    /// Like [`RunCursor::new`], but boundary-crossing `next`/`previous`
    /// cycle around instead of yielding `None`.
    pub fn with_wrap(set: &'a RunSet, wrap: bool) -> Self {
        let mut cursor = RunCursor {
            set,
            wrap,
            current_run: 0,
            run_start: 0,
            run_end: 0,
            current: None,
            last_current: None,
        };
        cursor.move_to_start();
        cursor
    }

    /// The position the cursor is on, or `None` past a boundary or when
    /// the set is empty.
    pub fn current(&self) -> Option<u32> {
        self.current
    }

    /// The position before the most recent move.
    pub fn last_current(&self) -> Option<u32> {
        self.last_current
    }

    /// Rank of the current position within the set.
    pub fn current_index_number(&self) -> Option<u32> {
        self.set.index_number(self.current?)
    }

    /// Repositions the cursor after `run` (the index of the run holding the
    /// new current position).
    fn enter_run(&mut self, run: usize) {
        self.run_start = self.set.runs[run];
        self.current_run = run + 1;
        self.run_end = self.set.runs[self.current_run];
    }

    /// Steps to the next member. Once `None` is returned only a move call
    /// clears the end state.
    pub fn next(&mut self) -> Option<u32> {
        let cur = self.current?;
        self.last_current = Some(cur);
        let mut next = cur + 1;
        if next >= self.run_end {
            let runs = self.set.runs();
            self.current_run += 1;
            if self.current_run >= runs.len() {
                if self.wrap {
                    self.current_run = usize::from(!self.set.first_value);
                } else {
                    self.current_run -= 1;
                    self.current = None;
                    return None;
                }
            }
            next = runs[self.current_run];
            self.enter_run(self.current_run);
        }
        self.current = Some(next);
        self.current
    }

    /// Steps to the previous member.
    pub fn previous(&mut self) -> Option<u32> {
        let cur = self.current?;
        self.last_current = Some(cur);
        if cur == self.run_start {
            let runs = self.set.runs();
            // Each true run owns two transitions, so the first true run's
            // end transition sits at index 1 or 2.
            if self.current_run > 2 {
                self.current_run -= 2;
            } else if self.wrap {
                self.current_run = runs.len() - 1;
            } else {
                self.current = None;
                return None;
            }
            self.run_end = runs[self.current_run];
            self.run_start = runs[self.current_run - 1];
            self.current = Some(self.run_end - 1);
        } else {
            self.current = Some(cur - 1);
        }
        self.current
    }

    /// Moves to `pos` when it is a member, otherwise to the nearer member
    /// (exact ties go right). `None` only when the set is empty.
    pub fn move_to_value(&mut self, pos: u32) -> Option<u32> {
        self.last_current = self.current;
        self.current = None;
        if self.set.is_empty() {
            return None;
        }
        let runs = self.set.runs();
        let mut run = self.set.run_index(pos);
        if self.set.run_value(run) {
            self.current = Some(pos);
        } else {
            let right = runs.get(run + 1).copied();
            let left = if run >= 1 { Some(runs[run] - 1) } else { None };
            match (left, right) {
                (Some(l), Some(r)) => {
                    if r - pos <= pos - l {
                        run += 1;
                        self.current = Some(r);
                    } else {
                        run -= 1;
                        self.current = Some(l);
                    }
                }
                (None, Some(r)) => {
                    run += 1;
                    self.current = Some(r);
                }
                (Some(l), None) => {
                    run -= 1;
                    self.current = Some(l);
                }
                (None, None) => return None,
            }
        }
        self.enter_run(run);
        self.current
    }

    /// Moves to the n-th member in rank order, clamped to the last member
    /// when `n` is out of range. `None` only when the set is empty.
    pub fn move_to_index_number(&mut self, n: u32) -> Option<u32> {
        self.last_current = self.current;
        self.current = None;
        if self.set.is_empty() {
            return None;
        }
        let runs = self.set.runs();
        let mut count = 0u32;
        let mut i = usize::from(!self.set.first_value);
        while i + 1 < runs.len() {
            let (s, e) = (runs[i], runs[i + 1]);
            count += e - s;
            if n < count {
                self.current_run = i + 1;
                self.run_start = s;
                self.run_end = e;
                self.current = Some(e - (count - n));
                return self.current;
            }
            i += 2;
        }
        self.current_run = runs.len() - 1;
        self.run_end = runs[self.current_run];
        self.run_start = runs[self.current_run - 1];
        self.current = Some(self.run_end - 1);
        self.current
    }

    /// Moves to the smallest member.
    pub fn move_to_start(&mut self) -> Option<u32> {
        self.last_current = self.current;
        self.current = None;
        self.current_run = 0;
        if !self.set.is_empty() {
            let first = usize::from(!self.set.first_value);
            self.current = Some(self.set.runs[first]);
            self.enter_run(first);
        }
        self.current
    }

    /// Moves to the largest member.
    pub fn move_to_end(&mut self) -> Option<u32> {
        self.last_current = self.current;
        self.current = None;
        if !self.set.is_empty() {
            let runs = self.set.runs();
            self.current_run = runs.len() - 1;
            self.run_end = runs[self.current_run];
            self.run_start = runs[self.current_run - 1];
            self.current = Some(self.run_end - 1);
        }
        self.current
    }
}
