use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Discriminator,
    Critic,
    Generator,
}

/// Hands out discriminator, critic and generator steps in that order, one per
/// batch. A cycle ends once every budget is spent; the budgets are then
/// replenished.
#[derive(Debug, Clone)]
pub struct StepSchedule {
    d_steps: usize,
    c_steps: usize,
    g_steps: usize,
    d_left: usize,
    c_left: usize,
    g_left: usize,
}

impl StepSchedule {
    pub fn new(d_steps: usize, c_steps: usize, g_steps: usize) -> Result<Self> {
        if d_steps + c_steps + g_steps == 0 {
            return Err(Error::config("at least one of d_steps, c_steps, g_steps must be positive"));
        }
        Ok(Self {
            d_steps,
            c_steps,
            g_steps,
            d_left: d_steps,
            c_left: c_steps,
            g_left: g_steps,
        })
    }

    /// Consumes one step from the first non-empty budget.
    pub fn next_step(&mut self) -> StepKind {
        if self.d_left == 0 && self.c_left == 0 && self.g_left == 0 {
            self.replenish();
        }
        if self.d_left > 0 {
            self.d_left -= 1;
            StepKind::Discriminator
        } else if self.c_left > 0 {
            self.c_left -= 1;
            StepKind::Critic
        } else {
            self.g_left -= 1;
            StepKind::Generator
        }
    }

    /// True when the current cycle is spent. Replenishes the budgets.
    pub fn finish_cycle(&mut self) -> bool {
        if self.d_left > 0 || self.c_left > 0 || self.g_left > 0 {
            return false;
        }
        self.replenish();
        true
    }

    /// Starts a fresh cycle, dropping any partially spent one.
    pub fn replenish(&mut self) {
        self.d_left = self.d_steps;
        self.c_left = self.c_steps;
        self.g_left = self.g_steps;
    }

    pub fn runs(&self, kind: StepKind) -> bool {
        match kind {
            StepKind::Discriminator => self.d_steps > 0,
            StepKind::Critic => self.c_steps > 0,
            StepKind::Generator => self.g_steps > 0,
        }
    }
}
