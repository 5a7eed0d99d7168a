//! Streaming inference on a single layer.
//!
//! An [InferenceSession] owns the recurrent state of every sequence in its batch. The caller
//! holds the handle, there is no shared registry: two sessions never see each other's state
//! even when they run on the same layer.
//!
//! ```text
//!   begin ──> Uninitialized ──prime──> Primed ──step──> Stepping ──step──> Stepping
//!                   ^                     │                 │
//!                   └──────reset──────────┴─────────────────┤
//!                                                           end
//!                                                            v
//!                                                          Closed
//! ```
use rayon::prelude::*;

use crate::config::Mamba2Config;
use crate::error::{check_len, Error, Result};
use crate::layer::{Mamba2Layer, SequenceBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Primed,
    Stepping,
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Primed => "primed",
            Self::Stepping => "stepping",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What a sequence carries from one timestep to the next.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentState {
    // [d_conv - 1, conv_dim], oldest row first.
    conv: Vec<f32>,
    // [nheads, headdim, d_state]
    ssm: Vec<f32>,
}

impl RecurrentState {
    pub fn zeros(cfg: &Mamba2Config) -> Self {
        Self {
            conv: vec![0f32; cfg.conv_window() * cfg.conv_dim()],
            ssm: vec![0f32; cfg.ssm_state_len()],
        }
    }

    pub fn new(cfg: &Mamba2Config, conv: Vec<f32>, ssm: Vec<f32>) -> Result<Self> {
        let state = Self { conv, ssm };
        state.validate(cfg)?;
        Ok(state)
    }

    pub fn validate(&self, cfg: &Mamba2Config) -> Result<()> {
        check_len("cached conv window", cfg.conv_window() * cfg.conv_dim(), self.conv.len())?;
        check_len("cached ssm state", cfg.ssm_state_len(), self.ssm.len())
    }

    pub fn conv_window(&self) -> &[f32] {
        &self.conv
    }

    pub fn ssm(&self) -> &[f32] {
        &self.ssm
    }

    pub(crate) fn conv_mut(&mut self) -> &mut [f32] {
        &mut self.conv
    }

    pub(crate) fn ssm_mut(&mut self) -> &mut [f32] {
        &mut self.ssm
    }

    fn clear(&mut self) {
        self.conv.fill(0.0);
        self.ssm.fill(0.0);
    }
}

/// Incremental evaluation of one layer over a batch of sequences.
///
/// `prime` runs the bulk path over a known context and keeps the state it ends in, `step`
/// then consumes one new timestep per sequence. Outputs match what a bulk forward over the
/// whole history would produce at the same positions.
pub struct InferenceSession<'a> {
    layer: &'a Mamba2Layer,
    states: Vec<RecurrentState>,
    positions: Vec<usize>,
    phase: SessionPhase,
}

impl<'a> InferenceSession<'a> {
    /// Allocates zeroed state for `batch_size` sequences. Nothing is computed until
    /// [InferenceSession::prime].
    pub fn begin(layer: &'a Mamba2Layer, batch_size: usize) -> Self {
        tracing::debug!(layer = layer.layer_idx(), batch_size, "begin session");
        Self {
            layer,
            states: vec![RecurrentState::zeros(layer.config()); batch_size],
            positions: vec![0; batch_size],
            phase: SessionPhase::Uninitialized,
        }
    }

    /// Continues from previously captured states, e.g. cloned out of [InferenceSession::states].
    pub fn resume(layer: &'a Mamba2Layer, states: Vec<RecurrentState>) -> Result<Self> {
        for state in states.iter() {
            state.validate(layer.config())?;
        }
        tracing::debug!(layer = layer.layer_idx(), batch_size = states.len(), "resume session");
        Ok(Self {
            layer,
            positions: vec![0; states.len()],
            states,
            phase: SessionPhase::Primed,
        })
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn batch_size(&self) -> usize {
        self.positions.len()
    }

    pub fn layer_idx(&self) -> usize {
        self.layer.layer_idx()
    }

    /// Number of timesteps of sequence `i` consumed by this session.
    pub fn position(&self, i: usize) -> usize {
        self.positions[i]
    }

    pub fn states(&self) -> &[RecurrentState] {
        &self.states
    }

    /// Runs the bulk path over `context` and caches the state reached at its end.
    ///
    /// Sequences may be empty, in which case the session starts from the zero state.
    pub fn prime(&mut self, context: &SequenceBatch) -> Result<SequenceBatch> {
        if self.phase != SessionPhase::Uninitialized {
            return Err(Error::InvalidState { op: "prime", phase: self.phase });
        }
        let cfg = self.layer.config();
        check_len("context width", cfg.d_model, context.width())?;
        check_len("context batch size", self.batch_size(), context.batch_size())?;

        let layer = self.layer;
        let (outputs, states): (Vec<_>, Vec<_>) = context
            .sequences()
            .par_iter()
            .map(|xs| -> Result<(Vec<f32>, RecurrentState)> {
                let mut state = RecurrentState::zeros(cfg);
                let ys = layer.forward_sequence(xs, &mut state)?;
                Ok((ys, state))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();

        self.states = states;
        self.positions = (0..context.batch_size()).map(|i| context.seq_len(i)).collect();
        self.phase = SessionPhase::Primed;
        tracing::debug!(layer = layer.layer_idx(), positions = ?self.positions, "primed session");
        SequenceBatch::new(cfg.d_model, outputs)
    }

    /// Consumes one new row per sequence, `[batch_size, d_model]` flattened, and returns the
    /// matching `[batch_size, d_model]` outputs.
    pub fn step(&mut self, inputs: &[f32]) -> Result<Vec<f32>> {
        match self.phase {
            SessionPhase::Primed | SessionPhase::Stepping => {}
            phase => return Err(Error::InvalidState { op: "step", phase }),
        }
        let d_model = self.layer.config().d_model;
        check_len("step input", self.batch_size() * d_model, inputs.len())?;

        let layer = self.layer;
        let outputs = self
            .states
            .par_iter_mut()
            .zip(inputs.par_chunks(d_model))
            .map(|(state, x)| layer.step_one(x, state))
            .collect::<Result<Vec<_>>>()?;

        for p in self.positions.iter_mut() {
            *p += 1;
        }
        self.phase = SessionPhase::Stepping;
        tracing::trace!(layer = layer.layer_idx(), "session step");
        Ok(outputs.concat())
    }

    /// Zeroes every cached state and goes back to [SessionPhase::Uninitialized].
    pub fn reset(&mut self) -> Result<()> {
        if self.phase == SessionPhase::Closed {
            return Err(Error::InvalidState { op: "reset", phase: self.phase });
        }
        for state in self.states.iter_mut() {
            state.clear();
        }
        self.positions.fill(0);
        self.phase = SessionPhase::Uninitialized;
        Ok(())
    }

    /// Releases the cached state. Any later `prime` or `step` fails.
    pub fn end(&mut self) {
        if self.phase != SessionPhase::Closed {
            tracing::debug!(layer = self.layer.layer_idx(), "end session");
        }
        self.states = Vec::new();
        self.positions = Vec::new();
        self.phase = SessionPhase::Closed;
    }
}
