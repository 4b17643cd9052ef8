//! Per-statement execution profiling: one `StatementContext` per query,
//! threaded explicitly through planner/executor calls rather than kept
//! in module-level mutable state, so concurrent statements never share
//! a profiler.
//!
//! Each `QPop::execute()` call a caller chooses to profile gets a
//! `CallStat` pushed on `StatementContext`'s call stack; nested calls
//! (a join's two children, say) record their own stats with `caller`
//! set to whichever stat was on top of the stack, so the whole call
//! graph can be reconstructed afterward without any global state.

use crate::error::{DbError, DbResult};
use std::cell::RefCell;
use std::time::{Duration, Instant};

/// Tracks minimum, maximum, and running sum across a collection of
/// values, without retaining the collection itself.
#[derive(Debug, Clone, Copy)]
pub struct MinMaxSum {
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub sum: u64,
}

impl Default for MinMaxSum {
    fn default() -> Self {
        MinMaxSum { min: None, max: None, sum: 0 }
    }
}

impl MinMaxSum {
    pub fn add(&mut self, value: u64) {
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        self.sum += value;
    }
}

/// One recorded invocation of an operator's `execute()`, covering its
/// whole lifetime as an iterator (construction through exhaustion).
#[derive(Debug)]
pub struct CallStat {
    /// Address of the operator instance, used the way the source uses
    /// `id(obj)`: to group stats by operator identity without needing
    /// operators to carry their own unique id field.
    pub oid: usize,
    pub operator_name: &'static str,
    pub caller: Option<usize>,
    started_at: Instant,
    elapsed: Duration,
    pub num_next_calls: u64,
    pub num_blocks_read: u64,
    pub num_blocks_written: u64,
    running: bool,
}

impl CallStat {
    fn new(oid: usize, operator_name: &'static str, caller: Option<usize>) -> Self {
        CallStat {
            oid,
            operator_name,
            caller,
            started_at: Instant::now(),
            elapsed: Duration::ZERO,
            num_next_calls: 0,
            num_blocks_read: 0,
            num_blocks_written: 0,
            running: true,
        }
    }

    fn pause(&mut self) {
        if self.running {
            self.elapsed += self.started_at.elapsed();
            self.running = false;
        }
    }

    fn resume(&mut self) {
        if !self.running {
            self.started_at = Instant::now();
            self.running = true;
        }
    }

    pub fn ns_elapsed(&self) -> u64 {
        let live = if self.running { self.started_at.elapsed() } else { Duration::ZERO };
        (self.elapsed + live).as_nanos() as u64
    }
}

/// A live, in-progress profiling span. `Drop` pauses the timer and
/// pops the call stack if the holder never calls `finish()` explicitly
/// (e.g. on an early return through `?`), matching the `finally:` block
/// the source uses to guarantee `close()` is always recorded.
pub struct Span<'a> {
    ctx: &'a StatementContext,
    stat_index: usize,
    finished: bool,
}

impl<'a> Span<'a> {
    pub fn record_next_call(&self) {
        self.ctx.with_stat_mut(self.stat_index, |s| s.num_next_calls += 1);
    }

    pub fn record_blocks(&self, read: u64, written: u64) {
        self.ctx.with_stat_mut(self.stat_index, |s| {
            s.num_blocks_read += read;
            s.num_blocks_written += written;
        });
    }

    /// Suspend this span's timer while a child call runs, so the time
    /// spent inside descendants isn't double-counted as this span's own.
    pub fn pause(&self) {
        self.ctx.pause(self.stat_index);
    }
    pub fn resume(&self) {
        self.ctx.resume(self.stat_index);
    }

    pub fn finish(mut self) -> DbResult<()> {
        self.ctx.call_end(self.stat_index)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for Span<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.ctx.call_end(self.stat_index);
        }
    }
}

/// Holds every `CallStat` recorded during one statement's execution,
/// plus the LIFO stack of calls currently in progress.
pub struct StatementContext {
    stats: RefCell<Vec<CallStat>>,
    call_stack: RefCell<Vec<usize>>,
}

impl StatementContext {
    pub fn new() -> Self {
        StatementContext {
            stats: RefCell::new(Vec::new()),
            call_stack: RefCell::new(Vec::new()),
        }
    }

    /// Begin profiling a call, returning a `Span` the caller should
    /// hold for the call's duration (a nested generator's lifetime, in
    /// the case of `execute()`).
    pub fn call_begin(&self, oid: usize, operator_name: &'static str) -> Span<'_> {
        let caller = self.call_stack.borrow().last().copied();
        let stat = CallStat::new(oid, operator_name, caller);
        let mut stats = self.stats.borrow_mut();
        let index = stats.len();
        stats.push(stat);
        self.call_stack.borrow_mut().push(index);
        Span { ctx: self, stat_index: index, finished: false }
    }

    fn call_end(&self, stat_index: usize) -> DbResult<()> {
        let mut stack = self.call_stack.borrow_mut();
        if stack.last().copied() != Some(stat_index) {
            return Err(DbError::profile("call stack integrity error"));
        }
        stack.pop();
        drop(stack);
        self.with_stat_mut(stat_index, |s| s.pause());
        Ok(())
    }

    /// Pause, then immediately resume, the timer for a call currently
    /// suspended while a nested call runs — used around each `next()`
    /// pull on a child iterator so a parent's elapsed time excludes
    /// time spent inside its children.
    pub fn pause(&self, stat_index: usize) {
        self.with_stat_mut(stat_index, |s| s.pause());
    }
    pub fn resume(&self, stat_index: usize) {
        self.with_stat_mut(stat_index, |s| s.resume());
    }

    fn with_stat_mut(&self, index: usize, f: impl FnOnce(&mut CallStat)) {
        if let Some(stat) = self.stats.borrow_mut().get_mut(index) {
            f(stat);
        }
    }

    /// Blocks read/written attributable to `stat` itself, versus its
    /// descendants, following the rule that a descendant's own
    /// `execute()` span's I/O counts toward "overall" but not toward
    /// this call's self reads/writes (which are only ever incurred by
    /// leaf-level storage calls, not by composing other operators).
    fn summarize_block_stats(&self, stats: &[CallStat], index: usize) -> (u64, u64, u64) {
        let stat = &stats[index];
        let mut reads = stat.num_blocks_read;
        let mut writes = stat.num_blocks_written;
        let mut overall = 0u64;
        for (i, child) in stats.iter().enumerate() {
            if child.caller != Some(index) {
                continue;
            }
            let (child_reads, child_writes, child_overall) = self.summarize_block_stats(stats, i);
            if child.operator_name.ends_with("::execute") {
                overall += child_overall;
            } else {
                reads += child_reads;
                writes += child_writes;
                overall += child_overall - child_reads - child_writes;
            }
        }
        (reads, writes, overall + reads + writes)
    }

    /// Aggregate every recorded `execute()` call for one operator
    /// identity (or every operator, if `oid` is `None`) into summary
    /// statistics suitable for a plan-level report.
    pub fn summarize(&self, oid: Option<usize>) -> ExecutionSummary {
        let stats = self.stats.borrow();
        let mut summary = ExecutionSummary::default();
        for (i, stat) in stats.iter().enumerate() {
            if !stat.operator_name.ends_with("::execute") {
                continue;
            }
            if oid.is_some() && oid != Some(stat.oid) {
                continue;
            }
            summary.num_calls += 1;
            summary.next_calls.add(stat.num_next_calls);
            summary.ns_elapsed.add(stat.ns_elapsed());
            let (reads, writes, overall) = self.summarize_block_stats(&stats, i);
            summary.blocks_read.add(reads);
            summary.blocks_written.add(writes);
            summary.blocks_overall.add(overall);
        }
        summary
    }

    /// A `Display`-friendly, indented tree of every recorded call,
    /// mirroring the source's `pstr_stats` report.
    pub fn render(&self) -> String {
        let stats = self.stats.borrow();
        let mut out = String::new();
        Self::render_children(&stats, None, 0, &mut out);
        out
    }

    fn render_children(stats: &[CallStat], caller: Option<usize>, indent: usize, out: &mut String) {
        let prefix = if indent == 0 { String::new() } else { format!("{}\\___", "    ".repeat(indent - 1)) };
        for (i, stat) in stats.iter().enumerate() {
            if stat.caller != caller {
                continue;
            }
            out.push_str(&format!("{prefix}{}[{:#x}]\n", stat.operator_name, stat.oid));
            let line_prefix = "    ".repeat(indent) + "| ";
            let next_desc = if stat.num_next_calls != 0 {
                format!("{} next() calls; ", stat.num_next_calls)
            } else {
                String::new()
            };
            out.push_str(&format!(
                "{line_prefix}{next_desc}elapsed: {:.3}ms\n",
                stat.ns_elapsed() as f64 / 1_000_000.0
            ));
            if stat.num_blocks_read + stat.num_blocks_written > 0 {
                out.push_str(&format!(
                    "{line_prefix}{} block reads; {} block writes\n",
                    stat.num_blocks_read, stat.num_blocks_written
                ));
            }
            Self::render_children(stats, Some(i), indent + 1, out);
        }
    }
}

impl Default for StatementContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionSummary {
    pub num_calls: u64,
    pub next_calls: MinMaxSum,
    pub ns_elapsed: MinMaxSum,
    pub blocks_read: MinMaxSum,
    pub blocks_written: MinMaxSum,
    pub blocks_overall: MinMaxSum,
}

/// Identifies an operator instance the way the source uses `id(obj)`:
/// the address a `&dyn QPop` trait object's data pointer resolves to.
pub fn operator_id(op: &dyn crate::executor::QPop) -> usize {
    op as *const dyn crate::executor::QPop as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_calls_attribute_blocks_correctly() {
        let ctx = StatementContext::new();
        let outer = ctx.call_begin(1, "Outer::execute");
        ctx.pause(0);
        {
            let inner = ctx.call_begin(2, "Inner::execute");
            inner.record_blocks(3, 1);
            inner.finish().unwrap();
        }
        ctx.resume(0);
        outer.record_blocks(1, 0);
        outer.finish().unwrap();

        let summary = ctx.summarize(None);
        assert_eq!(summary.num_calls, 2);
        assert_eq!(summary.blocks_overall.sum, 4 /* inner overall */ + 5 /* outer: 1 self + 4 inherited */);
    }

    #[test]
    fn out_of_order_end_is_an_error() {
        let ctx = StatementContext::new();
        let outer = ctx.call_begin(1, "Outer::execute");
        let inner = ctx.call_begin(2, "Inner::execute");
        assert!(outer.finish().is_err());
        drop(inner);
    }
}
