//! Classification of serial lines into verdict events.
//!
//! Each scenario picks exactly one [`VerdictRule`]. Within a rule, checks run
//! in a fixed order and the first match wins: the assertion-failure check
//! always comes first, then the rule's own patterns.

use std::collections::HashMap;

use regex::Regex;
use tracing::info;

use crate::error::{HarnessError, Result};

/// Prefixes of guest assertion-failure lines.
const FAILURE_PREFIXES: &[&str] = &["Error: ASSERT", "TEST_ASSERT"];

/// Iterations every CPU must exceed before the iteration rule passes.
pub const ITERATION_THRESHOLD: u64 = 20;

/// Printed by the NMI test once the sequential experiments are done.
pub const SEQUENTIAL_BANNER: &str = "Sequential experiments pass";

/// Random experiments required after the banner.
pub const EXPERIMENT_GOAL: usize = 10;

/// What a single line meant to the rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Nothing of interest.
    Ignored,
    /// Counted towards completion but not terminal.
    Progress,
    /// The rule's completion condition was reached.
    Passed,
    /// An assertion failure; carries the offending line.
    Failed(String),
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Passed | Event::Failed(_))
    }
}

/// Whether `line` reports a failed guest assertion.
pub fn is_assertion_failure(line: &str) -> bool {
    FAILURE_PREFIXES.iter().any(|p| line.starts_with(p)) && line.contains("failed")
}

/// Scenario-specific verdict rule.
#[derive(Debug)]
pub enum VerdictRule {
    Iterations(IterationRule),
    Experiments(ExperimentRule),
    /// Never terminal; only assertion failures are reported.
    Passive,
}

impl VerdictRule {
    pub fn classify(&mut self, line: &str) -> Result<Event> {
        if is_assertion_failure(line) {
            return Ok(Event::Failed(line.to_string()));
        }
        match self {
            VerdictRule::Iterations(rule) => rule.classify(line),
            VerdictRule::Experiments(rule) => Ok(rule.classify(line)),
            VerdictRule::Passive => Ok(Event::Ignored),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VerdictRule::Iterations(_) => "iterations",
            VerdictRule::Experiments(_) => "experiments",
            VerdictRule::Passive => "passive",
        }
    }
}

/// Iteration counts per CPU id. Never holds more keys than the guest has CPUs.
#[derive(Debug)]
pub struct PerCpuCounters {
    smp: usize,
    counts: HashMap<String, u64>,
}

impl PerCpuCounters {
    pub fn new(smp: usize) -> Self {
        Self { smp, counts: HashMap::with_capacity(smp) }
    }

    /// Count one iteration for `cpu`, returning its new total.
    pub fn increment(&mut self, cpu: &str) -> Result<u64> {
        if let Some(count) = self.counts.get_mut(cpu) {
            *count += 1;
            return Ok(*count);
        }
        if self.counts.len() >= self.smp {
            return Err(HarnessError::CpuCountExceeded {
                cpu: cpu.to_string(),
                seen: self.counts.len() + 1,
                smp: self.smp,
            });
        }
        self.counts.insert(cpu.to_string(), 1);
        Ok(1)
    }

    pub fn get(&self, cpu: &str) -> u64 {
        self.counts.get(cpu).copied().unwrap_or(0)
    }

    pub fn cpus_seen(&self) -> usize {
        self.counts.len()
    }

    /// True once every CPU has been seen and each one exceeded `threshold`.
    pub fn all_exceed(&self, threshold: u64) -> bool {
        self.counts.len() == self.smp && self.counts.values().all(|&c| c > threshold)
    }
}

/// Passes once every CPU has run more than `threshold` test iterations.
#[derive(Debug)]
pub struct IterationRule {
    pattern: Regex,
    counters: PerCpuCounters,
    threshold: u64,
}

impl IterationRule {
    /// `nested` selects the banner SHV prints when running under XMHF.
    pub fn new(smp: usize, nested: bool) -> Self {
        let pattern = if nested {
            r"^CPU\((0x[0-9a-f]+)\): SHV in XMHF test iter \d+$"
        } else {
            r"^CPU\((0x[0-9a-f]+)\): SHV test iter \d+$"
        };
        Self {
            pattern: Regex::new(pattern).expect("iteration pattern is valid"),
            counters: PerCpuCounters::new(smp),
            threshold: ITERATION_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn counters(&self) -> &PerCpuCounters {
        &self.counters
    }

    fn classify(&mut self, line: &str) -> Result<Event> {
        let Some(caps) = self.pattern.captures(line) else {
            return Ok(Event::Ignored);
        };
        self.counters.increment(&caps[1])?;
        if self.counters.all_exceed(self.threshold) {
            Ok(Event::Passed)
        } else {
            Ok(Event::Progress)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExperimentPhase {
    Sequential,
    Random,
    Done,
}

/// Waits for the sequential-experiments banner, then counts random
/// experiments up to a goal.
#[derive(Debug)]
pub struct ExperimentRule {
    pattern: Regex,
    phase: ExperimentPhase,
    count: usize,
    goal: usize,
}

impl Default for ExperimentRule {
    fn default() -> Self {
        Self::new(EXPERIMENT_GOAL)
    }
}

impl ExperimentRule {
    pub fn new(goal: usize) -> Self {
        Self {
            pattern: Regex::new(r"^Experiment: \d+$").expect("experiment pattern is valid"),
            phase: ExperimentPhase::Sequential,
            count: 0,
            goal,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn classify(&mut self, line: &str) -> Event {
        match self.phase {
            ExperimentPhase::Sequential => {
                if line == SEQUENTIAL_BANNER {
                    info!("Found {}", line);
                    self.phase = ExperimentPhase::Random;
                    if self.goal == 0 {
                        self.phase = ExperimentPhase::Done;
                        return Event::Passed;
                    }
                    Event::Progress
                } else {
                    Event::Ignored
                }
            }
            ExperimentPhase::Random => {
                if !self.pattern.is_match(line) {
                    return Event::Ignored;
                }
                self.count += 1;
                info!("Random exp progress: {} / {}", self.count, self.goal);
                if self.count >= self.goal {
                    self.phase = ExperimentPhase::Done;
                    Event::Passed
                } else {
                    Event::Progress
                }
            }
            ExperimentPhase::Done => Event::Ignored,
        }
    }
}
