//! Call tree statistics built from a stream of samples.
//!
//! The tree is laid out as:
//! - `AustinStats`: the root, one entry per process id
//! - `ProcessStats`: threads, plus child processes keyed by child id
//! - `ThreadStats`: a forest of top-level `FrameStats`
//! - `FrameStats`: one node per distinct call path prefix
//!
//! Every node keeps `total == own + Σ child.total` after each `update`.
//! Children are kept in first-seen order.
//!
//! Idle samples are accounted like any other: `wall` includes idle time,
//! `cpu` excludes it (the sampler reports 0 CPU for idle samples) and the
//! `idle` flag of a node is set when any contributing sample was idle.

use crate::parser::frame::{FrameId, FrameTable};
use crate::parser::schema::{AustinEvent, Decoded, Metric, Mode, Sample};
use crate::utils::error::{InvalidSample, MetricOverflow, StatsError};
use log::{debug, warn};
use std::collections::HashMap;

fn bump(hits: u64) -> Result<u64, MetricOverflow> {
    hits.checked_add(1).ok_or(MetricOverflow { field: "hits" })
}

/// Ordered children of a node, looked up by frame handle
#[derive(Debug, Clone, Default)]
pub struct Children {
    nodes: Vec<FrameStats>,
    index: HashMap<FrameId, usize>,
}

impl Children {
    pub fn get(&self, frame: FrameId) -> Option<&FrameStats> {
        self.index.get(&frame).map(|i| &self.nodes[*i])
    }

    fn entry(&mut self, frame: FrameId) -> &mut FrameStats {
        let i = match self.index.get(&frame) {
            Some(i) => *i,
            None => {
                self.nodes.push(FrameStats::new(frame));
                self.index.insert(frame, self.nodes.len() - 1);
                self.nodes.len() - 1
            }
        };
        &mut self.nodes[i]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FrameStats> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn total(&self) -> Result<Metric, MetricOverflow> {
        self.nodes
            .iter()
            .try_fold(Metric::default(), |acc, node| acc.checked_add(&node.total))
    }
}

impl<'a> IntoIterator for &'a Children {
    type Item = &'a FrameStats;
    type IntoIter = std::slice::Iter<'a, FrameStats>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

/// A node of the call tree
#[derive(Debug, Clone)]
pub struct FrameStats {
    frame: FrameId,

    /// Metric attributed to this frame as the leaf of a sample
    pub own: Metric,

    /// `own` plus the totals of all children
    pub total: Metric,

    /// Number of samples that went through this node
    pub hits: u64,

    children: Children,
}

impl FrameStats {
    fn new(frame: FrameId) -> Self {
        Self {
            frame,
            own: Metric::default(),
            total: Metric::default(),
            hits: 0,
            children: Children::default(),
        }
    }

    pub fn frame(&self) -> FrameId {
        self.frame
    }

    pub fn children(&self) -> &Children {
        &self.children
    }
}

/// Statistics of one thread.
///
/// Samples with no frames are accounted as the thread's `own` metric.
#[derive(Debug, Clone)]
pub struct ThreadStats {
    label: String,
    pub own: Metric,
    pub total: Metric,
    pub hits: u64,
    children: Children,
}

impl ThreadStats {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            own: Metric::default(),
            total: Metric::default(),
            hits: 0,
            children: Children::default(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Top-level frames
    pub fn children(&self) -> &Children {
        &self.children
    }

    /// Check that adding `metric` along `path` cannot overflow.
    /// Nodes that do not exist yet start from zero and cannot overflow.
    fn precheck(&self, path: &[Option<FrameId>], metric: &Metric) -> Result<(), MetricOverflow> {
        self.total.checked_add(metric)?;
        bump(self.hits)?;
        if path.is_empty() {
            self.own.checked_add(metric)?;
            return Ok(());
        }

        let mut children = &self.children;
        for (depth, frame) in path.iter().enumerate() {
            let Some(node) = frame.and_then(|f| children.get(f)) else {
                return Ok(());
            };
            node.total.checked_add(metric)?;
            bump(node.hits)?;
            if depth + 1 == path.len() {
                node.own.checked_add(metric)?;
            }
            children = &node.children;
        }

        Ok(())
    }

    fn record(&mut self, path: &[FrameId], metric: &Metric) -> Result<(), MetricOverflow> {
        self.total.accumulate(metric)?;
        self.hits = bump(self.hits)?;
        if path.is_empty() {
            return self.own.accumulate(metric);
        }

        let mut children = &mut self.children;
        for (depth, frame) in path.iter().enumerate() {
            let node = children.entry(*frame);
            node.total.accumulate(metric)?;
            node.hits = bump(node.hits)?;
            if depth + 1 == path.len() {
                node.own.accumulate(metric)?;
            }
            children = &mut node.children;
        }

        Ok(())
    }
}

/// Statistics of one process, or of a child of one
#[derive(Debug, Clone)]
pub struct ProcessStats {
    pid: u32,
    child: Option<u32>,
    threads: Vec<ThreadStats>,
    thread_index: HashMap<String, usize>,
    children: Vec<ProcessStats>,
    child_index: HashMap<u32, usize>,
}

impl ProcessStats {
    fn new(pid: u32, child: Option<u32>) -> Self {
        Self {
            pid,
            child,
            threads: Vec::new(),
            thread_index: HashMap::new(),
            children: Vec::new(),
            child_index: HashMap::new(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Child id, `None` for a top-level process
    pub fn child(&self) -> Option<u32> {
        self.child
    }

    /// `<pid>` or `<pid>/<child>`
    pub fn name(&self) -> String {
        match self.child {
            Some(child) => format!("{}/{}", self.pid, child),
            None => self.pid.to_string(),
        }
    }

    pub fn threads(&self) -> &[ThreadStats] {
        &self.threads
    }

    pub fn thread(&self, label: &str) -> Option<&ThreadStats> {
        self.thread_index.get(label).map(|i| &self.threads[*i])
    }

    pub fn children(&self) -> &[ProcessStats] {
        &self.children
    }

    pub fn child_process(&self, child: u32) -> Option<&ProcessStats> {
        self.child_index.get(&child).map(|i| &self.children[*i])
    }

    fn thread_entry(&mut self, label: &str) -> &mut ThreadStats {
        let i = match self.thread_index.get(label) {
            Some(i) => *i,
            None => {
                self.threads.push(ThreadStats::new(label));
                self.thread_index.insert(label.to_string(), self.threads.len() - 1);
                self.threads.len() - 1
            }
        };
        &mut self.threads[i]
    }

    fn child_entry(&mut self, child: u32) -> &mut ProcessStats {
        let i = match self.child_index.get(&child) {
            Some(i) => *i,
            None => {
                self.children.push(ProcessStats::new(self.pid, Some(child)));
                self.child_index.insert(child, self.children.len() - 1);
                self.children.len() - 1
            }
        };
        &mut self.children[i]
    }

    /// This process and all of its children, parents first
    pub fn flatten(&self) -> Vec<&ProcessStats> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.flatten());
        }
        out
    }
}

/// A root-to-node call path with the metric attributed to its last node
#[derive(Debug, Clone)]
pub struct StackPath<'a> {
    pub process: &'a ProcessStats,
    pub thread: &'a ThreadStats,

    /// Root first; empty for samples that had no frames
    pub frames: Vec<FrameId>,

    pub own: Metric,
}

/// Aggregated statistics of a whole sampling run.
///
/// **Public** - main aggregation state
///
/// Created empty and mutated only through [`update`](Self::update),
/// [`ingest`](Self::ingest) and [`apply`](Self::apply). Exporters borrow it
/// immutably once the run is over.
#[derive(Debug, Clone, Default)]
pub struct AustinStats {
    mode: Mode,
    metadata: Vec<(String, String)>,
    processes: Vec<ProcessStats>,
    process_index: HashMap<u32, usize>,
    frames: FrameTable,
    samples: u64,
    errors: u64,
}

impl AustinStats {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Record a metadata entry. A `mode` entry also switches the mode.
    pub fn set_metadata(&mut self, name: &str, value: &str) {
        if name == "mode" {
            match value.parse::<Mode>() {
                Ok(mode) => self.mode = mode,
                Err(err) => warn!("Ignoring mode metadata: {}", err),
            }
        }

        match self.metadata.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.metadata.push((name.to_string(), value.to_string())),
        }
    }

    /// Metadata entries in the order they were first seen
    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    pub fn get_metadata(&self, name: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Number of samples accepted into the tree
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Number of records rejected as invalid
    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// Top-level processes, in first-seen order
    pub fn processes(&self) -> &[ProcessStats] {
        &self.processes
    }

    pub fn process(&self, pid: u32) -> Option<&ProcessStats> {
        self.process_index.get(&pid).map(|i| &self.processes[*i])
    }

    pub fn thread(&self, pid: u32, child: Option<u32>, label: &str) -> Option<&ThreadStats> {
        let process = self.process(pid)?;
        match child {
            Some(child) => process.child_process(child)?.thread(label),
            None => process.thread(label),
        }
    }

    /// Every process, children included, parents first
    pub fn all_processes(&self) -> Vec<&ProcessStats> {
        self.processes.iter().flat_map(|p| p.flatten()).collect()
    }

    fn process_entry(&mut self, pid: u32, child: Option<u32>) -> &mut ProcessStats {
        let i = match self.process_index.get(&pid) {
            Some(i) => *i,
            None => {
                self.processes.push(ProcessStats::new(pid, None));
                self.process_index.insert(pid, self.processes.len() - 1);
                self.processes.len() - 1
            }
        };

        let process = &mut self.processes[i];
        match child {
            Some(child) => process.child_entry(child),
            None => process,
        }
    }

    /// Fold one sample into the tree.
    ///
    /// # Errors
    /// * `StatsError::Overflow` - a counter on the sample path would wrap.
    ///   The tree is left untouched.
    pub fn update(&mut self, sample: &Sample) -> Result<(), StatsError> {
        let existing: Vec<Option<FrameId>> =
            sample.frames.iter().map(|f| self.frames.get(f)).collect();

        if let Some(thread) = self.thread(sample.pid, sample.child, &sample.thread) {
            thread.precheck(&existing, &sample.metric)?;
        }
        let samples = self
            .samples
            .checked_add(1)
            .ok_or(MetricOverflow { field: "samples" })?;

        let path: Vec<FrameId> = sample.frames.iter().map(|f| self.frames.intern(f)).collect();
        self.process_entry(sample.pid, sample.child)
            .thread_entry(&sample.thread)
            .record(&path, &sample.metric)?;
        self.samples = samples;

        Ok(())
    }

    /// Count a record that could not be decoded
    pub fn record_error(&mut self, err: &InvalidSample) {
        debug!("Skipping {}", err);
        self.errors = self.errors.saturating_add(1);
    }

    /// Fold a decoding result into the tree.
    ///
    /// An invalid record is counted and handed back; the tree is untouched.
    pub fn ingest(&mut self, decoded: Result<Sample, InvalidSample>) -> Result<(), StatsError> {
        match decoded {
            Ok(sample) => self.update(&sample),
            Err(err) => {
                self.record_error(&err);
                Err(err.into())
            }
        }
    }

    /// Fold any decoded item: metadata is recorded, samples are aggregated
    pub fn apply(&mut self, decoded: Decoded) -> Result<(), StatsError> {
        match decoded {
            Ok(AustinEvent::Metadata { name, value }) => {
                self.set_metadata(&name, &value);
                Ok(())
            }
            Ok(AustinEvent::Sample(sample)) => self.update(&sample),
            Err(err) => self.ingest(Err(err)),
        }
    }

    /// Sum of the totals of every thread of every process
    pub fn total(&self) -> Result<Metric, MetricOverflow> {
        self.all_processes()
            .iter()
            .flat_map(|p| p.threads())
            .try_fold(Metric::default(), |acc, t| acc.checked_add(&t.total))
    }

    /// Every node with a non-zero own metric, depth first
    pub fn own_paths(&self) -> Vec<StackPath<'_>> {
        let mut out = Vec::new();

        for process in self.all_processes() {
            for thread in process.threads() {
                if !thread.own.is_zero() {
                    out.push(StackPath {
                        process,
                        thread,
                        frames: Vec::new(),
                        own: thread.own,
                    });
                }

                let mut prefix = Vec::new();
                collect_paths(process, thread, &thread.children, &mut prefix, &mut out);
            }
        }

        out
    }

    /// Verify `total == own + Σ child.total` on every node.
    ///
    /// Returns a description of the first node that breaks it.
    pub fn check_invariants(&self) -> Result<(), String> {
        for process in self.all_processes() {
            for thread in process.threads() {
                let where_ = format!("process {} thread {}", process.name(), thread.label());
                check_node(&where_, &thread.own, &thread.total, &thread.children)?;
                check_children(&where_, &thread.children)?;
            }
        }
        Ok(())
    }
}

fn collect_paths<'a>(
    process: &'a ProcessStats,
    thread: &'a ThreadStats,
    children: &'a Children,
    prefix: &mut Vec<FrameId>,
    out: &mut Vec<StackPath<'a>>,
) {
    for node in children {
        prefix.push(node.frame);
        if !node.own.is_zero() {
            out.push(StackPath {
                process,
                thread,
                frames: prefix.clone(),
                own: node.own,
            });
        }
        collect_paths(process, thread, &node.children, prefix, out);
        prefix.pop();
    }
}

fn check_node(where_: &str, own: &Metric, total: &Metric, children: &Children) -> Result<(), String> {
    let expected = children
        .total()
        .and_then(|sum| sum.checked_add(own))
        .map_err(|err| format!("{}: {}", where_, err))?;

    // idle is an OR over samples, not a sum
    if expected.wall != total.wall
        || expected.cpu != total.cpu
        || expected.memory_alloc != total.memory_alloc
        || expected.memory_dealloc != total.memory_dealloc
    {
        return Err(format!(
            "{}: total {:?} != own + children {:?}",
            where_, total, expected
        ));
    }
    Ok(())
}

fn check_children(where_: &str, children: &Children) -> Result<(), String> {
    for node in children {
        let here = format!("{} frame {}", where_, node.frame.index());
        check_node(&here, &node.own, &node.total, &node.children)?;
        check_children(&here, &node.children)?;
    }
    Ok(())
}
