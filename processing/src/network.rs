//! Processing network
//!
//! Steps live in an arena keyed by [`StepId`], and every edge is recorded
//! on both of its ends. One mutex guards the whole graph, so a status
//! change and its propagation to all dependent steps happen atomically.
//! Step work runs with the lock released.

use crate::error::{ProcessingError, ProcessingResult};
use crate::step::{StepStatus, StepWork};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// Stable handle of a step within its network
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId(usize);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Node {
    name: String,
    status: StepStatus,
    work: Arc<dyn StepWork>,
    precursors: BTreeSet<StepId>,
    successors: BTreeSet<StepId>,
}

type Claim = (StepId, Arc<dyn StepWork>, String);

#[derive(Default)]
struct Graph {
    nodes: BTreeMap<StepId, Node>,
    next_id: usize,
}

impl Graph {
    fn node(&self, id: StepId) -> ProcessingResult<&Node> {
        self.nodes.get(&id).ok_or(ProcessingError::NotFound(id))
    }

    fn status_of(&self, id: StepId) -> StepStatus {
        self.nodes.get(&id).map_or(StepStatus::Idle, |n| n.status)
    }

    /// Status a step should have given the status of its precursors
    fn derived(&self, id: StepId) -> StepStatus {
        let Some(node) = self.nodes.get(&id) else {
            return StepStatus::Idle;
        };
        if node.precursors.is_empty() {
            return node.status;
        }
        let mut least = StepStatus::Complete;
        for &precursor in &node.precursors {
            let status = self.status_of(precursor);
            if status == StepStatus::Failed {
                return StepStatus::Failed;
            }
            least = least.min(status);
        }
        if least < StepStatus::Complete {
            return StepStatus::Idle;
        }
        match node.status {
            StepStatus::Idle => StepStatus::NeedsWork,
            other => other,
        }
    }

    /// Whether the precursors permit setting `status` explicitly
    fn allows(&self, id: StepId, status: StepStatus) -> bool {
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        if node.precursors.is_empty() || status == StepStatus::Idle {
            return true;
        }
        let statuses: Vec<StepStatus> =
            node.precursors.iter().map(|&p| self.status_of(p)).collect();
        if statuses.contains(&StepStatus::Failed) {
            return status == StepStatus::Failed;
        }
        statuses.iter().all(|&s| s == StepStatus::Complete)
    }

    /// Bring one step in line with its precursors, returning whether it
    /// changed
    fn refresh(&mut self, id: StepId) -> bool {
        let derived = self.derived(id);
        match self.nodes.get_mut(&id) {
            Some(node) if node.status != derived => {
                tracing::debug!("step {} '{}' {} -> {}", id, node.name, node.status, derived);
                node.status = derived;
                true
            }
            _ => false,
        }
    }

    /// Refresh the successors of `start`, following every change further
    /// downstream
    fn propagate(&mut self, start: StepId) {
        let mut pending: Vec<StepId> = self
            .nodes
            .get(&start)
            .map(|n| n.successors.iter().copied().collect())
            .unwrap_or_default();
        while let Some(id) = pending.pop() {
            if self.refresh(id) {
                if let Some(node) = self.nodes.get(&id) {
                    pending.extend(node.successors.iter().copied());
                }
            }
        }
    }

    /// Whether `to` is downstream of `from`
    fn reaches(&self, from: StepId, to: StepId) -> bool {
        let mut seen = BTreeSet::new();
        let mut pending = vec![from];
        while let Some(id) = pending.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                pending.extend(node.successors.iter().copied());
            }
        }
        false
    }

    fn find_needswork(&self) -> Option<StepId> {
        self.nodes
            .iter()
            .find(|(_, node)| node.status == StepStatus::NeedsWork)
            .map(|(&id, _)| id)
    }

    fn any_working(&self) -> bool {
        self.nodes.values().any(|node| node.status == StepStatus::Working)
    }

    /// Move a step from needswork to working
    fn claim(&mut self, id: StepId) -> Option<Claim> {
        if self.refresh(id) {
            self.propagate(id);
        }
        let node = self.nodes.get_mut(&id)?;
        if node.status != StepStatus::NeedsWork {
            tracing::debug!("step {} is {}, no work needed", id, node.status);
            return None;
        }
        node.status = StepStatus::Working;
        Some((id, node.work.clone(), node.name.clone()))
    }

    fn finish(&mut self, id: StepId, status: StepStatus) {
        match self.nodes.get_mut(&id) {
            Some(node) => node.status = status,
            None => {
                tracing::warn!("step {} was removed while working", id);
                return;
            }
        }
        self.propagate(id);
    }
}

/// A graph of processing steps
#[derive(Default)]
pub struct ProcessingNetwork {
    graph: Mutex<Graph>,
    progress: Condvar,
}

impl ProcessingNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an unconnected step in status idle
    pub fn add_step(&self, name: impl Into<String>, work: Arc<dyn StepWork>) -> StepId {
        let mut graph = self.lock();
        let id = StepId(graph.next_id);
        graph.next_id += 1;
        let name = name.into();
        tracing::debug!("new processing step {} '{}'", id, name);
        graph.nodes.insert(
            id,
            Node {
                name,
                status: StepStatus::Idle,
                work,
                precursors: BTreeSet::new(),
                successors: BTreeSet::new(),
            },
        );
        id
    }

    /// Unlink a step from all its neighbours and drop it
    pub fn remove_step(&self, id: StepId) -> ProcessingResult<()> {
        let mut graph = self.lock();
        let node = graph
            .nodes
            .remove(&id)
            .ok_or(ProcessingError::NotFound(id))?;
        tracing::debug!("removing step {} '{}'", id, node.name);
        for precursor in &node.precursors {
            if let Some(p) = graph.nodes.get_mut(precursor) {
                p.successors.remove(&id);
            }
        }
        for &successor in &node.successors {
            if let Some(s) = graph.nodes.get_mut(&successor) {
                s.precursors.remove(&id);
            }
            if graph.refresh(successor) {
                graph.propagate(successor);
            }
        }
        self.progress.notify_all();
        Ok(())
    }

    /// Make `precursor` an input of `step`
    pub fn add_precursor(&self, step: StepId, precursor: StepId) -> ProcessingResult<()> {
        if step == precursor {
            return Err(ProcessingError::SelfDependency(step));
        }
        let mut graph = self.lock();
        graph.node(precursor)?;
        if graph.node(step)?.precursors.contains(&precursor) {
            return Ok(());
        }
        if graph.reaches(step, precursor) {
            return Err(ProcessingError::Cycle { precursor, step });
        }
        tracing::debug!("{} becomes precursor of {}", precursor, step);
        if let Some(node) = graph.nodes.get_mut(&step) {
            node.precursors.insert(precursor);
        }
        if let Some(node) = graph.nodes.get_mut(&precursor) {
            node.successors.insert(step);
        }
        if graph.refresh(step) {
            graph.propagate(step);
        }
        Ok(())
    }

    pub fn add_successor(&self, step: StepId, successor: StepId) -> ProcessingResult<()> {
        self.add_precursor(successor, step)
    }

    pub fn remove_precursor(&self, step: StepId, precursor: StepId) -> ProcessingResult<()> {
        let mut graph = self.lock();
        graph.node(precursor)?;
        if !graph.node(step)?.precursors.contains(&precursor) {
            return Ok(());
        }
        tracing::debug!("{} no longer precursor of {}", precursor, step);
        if let Some(node) = graph.nodes.get_mut(&step) {
            node.precursors.remove(&precursor);
        }
        if let Some(node) = graph.nodes.get_mut(&precursor) {
            node.successors.remove(&step);
        }
        if graph.refresh(step) {
            graph.propagate(step);
        }
        self.progress.notify_all();
        Ok(())
    }

    pub fn remove_successor(&self, step: StepId, successor: StepId) -> ProcessingResult<()> {
        self.remove_precursor(successor, step)
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().nodes.is_empty()
    }

    pub fn name(&self, id: StepId) -> ProcessingResult<String> {
        Ok(self.lock().node(id)?.name.clone())
    }

    /// First step with the given name
    pub fn by_name(&self, name: &str) -> ProcessingResult<StepId> {
        self.lock()
            .nodes
            .iter()
            .find(|(_, node)| node.name == name)
            .map(|(&id, _)| id)
            .ok_or_else(|| ProcessingError::NoSuchName(name.to_string()))
    }

    pub fn precursors(&self, id: StepId) -> ProcessingResult<Vec<StepId>> {
        Ok(self.lock().node(id)?.precursors.iter().copied().collect())
    }

    pub fn successors(&self, id: StepId) -> ProcessingResult<Vec<StepId>> {
        Ok(self.lock().node(id)?.successors.iter().copied().collect())
    }

    /// Steps nothing depends on
    pub fn terminals(&self) -> Vec<StepId> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, node)| node.successors.is_empty())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Steps without precursors
    pub fn initials(&self) -> Vec<StepId> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, node)| node.precursors.is_empty())
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn status(&self, id: StepId) -> ProcessingResult<StepStatus> {
        Ok(self.lock().node(id)?.status)
    }

    /// Set the status of a step from outside, e.g. after work done
    /// elsewhere
    ///
    /// Does nothing and returns `false` if the precursors do not allow
    /// the new status.
    pub fn set_status(&self, id: StepId, status: StepStatus) -> ProcessingResult<bool> {
        let mut graph = self.lock();
        let current = graph.node(id)?.status;
        if !graph.allows(id, status) {
            tracing::debug!("precursors of {} do not allow {}", id, status);
            return Ok(false);
        }
        if current != status {
            tracing::debug!("step {} {} -> {}", id, current, status);
            if let Some(node) = graph.nodes.get_mut(&id) {
                node.status = status;
            }
            graph.propagate(id);
            self.progress.notify_all();
        }
        Ok(true)
    }

    /// Recompute a step from its precursors and pass the result on to
    /// its successors
    pub fn checkstate(&self, id: StepId) -> ProcessingResult<StepStatus> {
        let mut graph = self.lock();
        graph.node(id)?;
        graph.refresh(id);
        graph.propagate(id);
        self.progress.notify_all();
        Ok(graph.status_of(id))
    }

    /// Recompute every step
    pub fn checkstate_all(&self) {
        let mut graph = self.lock();
        let ids: Vec<StepId> = graph.nodes.keys().copied().collect();
        for id in ids {
            if graph.refresh(id) {
                graph.propagate(id);
            }
        }
        self.progress.notify_all();
    }

    pub fn has_needswork(&self) -> bool {
        self.lock().find_needswork().is_some()
    }

    /// Run a step if it needs work, returning its status afterwards
    pub fn work(&self, id: StepId) -> ProcessingResult<StepStatus> {
        let claim = {
            let mut graph = self.lock();
            graph.node(id)?;
            graph.claim(id)
        };
        match claim {
            Some((id, work, name)) => Ok(self.run(id, &name, work.as_ref())),
            None => self.status(id),
        }
    }

    /// Ask a step to abort its work
    pub fn cancel(&self, id: StepId) -> ProcessingResult<()> {
        let work = self.lock().node(id)?.work.clone();
        tracing::debug!("cancelling step {}", id);
        work.cancel();
        Ok(())
    }

    fn run(&self, id: StepId, name: &str, work: &dyn StepWork) -> StepStatus {
        tracing::debug!("step {} '{}' starts working", id, name);
        let started = Instant::now();
        let status = match catch_unwind(AssertUnwindSafe(|| work.do_work())) {
            Ok(Ok(status @ (StepStatus::Complete | StepStatus::Failed | StepStatus::Idle))) => status,
            Ok(Ok(status)) => {
                tracing::warn!("step {} '{}' reported {} after working", id, name, status);
                StepStatus::Failed
            }
            Ok(Err(e)) => {
                tracing::error!("step {} '{}' failed: {:#}", id, name, e);
                StepStatus::Failed
            }
            Err(_) => {
                tracing::error!("step {} '{}' panicked", id, name);
                StepStatus::Failed
            }
        };
        tracing::debug!(
            "step {} '{}' {} after {:.3}s",
            id,
            name,
            status,
            started.elapsed().as_secs_f64()
        );
        let mut graph = self.lock();
        graph.finish(id, status);
        self.progress.notify_all();
        status
    }

    /// Work all steps one after the other until none needs work,
    /// returning how many were worked
    pub fn process(&self) -> usize {
        self.checkstate_all();
        let mut count = 0;
        loop {
            let claim = {
                let mut graph = self.lock();
                match graph.find_needswork() {
                    Some(id) => graph.claim(id),
                    None => None,
                }
            };
            let Some((id, work, name)) = claim else {
                break;
            };
            self.run(id, &name, work.as_ref());
            count += 1;
        }
        tracing::debug!("processed {} steps", count);
        count
    }

    /// Like [`process`](Self::process), but with up to `threads` steps
    /// working at the same time
    pub fn process_parallel(&self, threads: usize) -> usize {
        self.checkstate_all();
        let count = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..threads.max(1) {
                scope.spawn(|| {
                    while let Some((id, work, name)) = self.next_claim() {
                        self.run(id, &name, work.as_ref());
                        count.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        let count = count.into_inner();
        tracing::debug!("processed {} steps in parallel", count);
        count
    }

    /// Block until some step can be claimed, or return `None` once nothing
    /// needs work and nothing is in progress that could change that
    fn next_claim(&self) -> Option<Claim> {
        let mut graph = self.lock();
        loop {
            if let Some(id) = graph.find_needswork() {
                if let Some(claim) = graph.claim(id) {
                    return Some(claim);
                }
                continue;
            }
            if !graph.any_working() {
                return None;
            }
            graph = self
                .progress
                .wait(graph)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}
