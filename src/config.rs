use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scan::ScanKind;

/// Hyper-parameters of a single Mamba2 mixer layer.
///
/// Every field has a default, so a JSON config only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mamba2Config {
    pub d_model: usize,
    pub d_state: usize,
    pub d_conv: usize,
    pub expand: usize,
    pub headdim: usize,
    pub chunk_size: usize,
    /// Width of each of the two MLP side channels emitted by the input projection.
    pub d_mlp: usize,
    pub norm_eps: f32,
    pub norm_before_gate: bool,
    pub scan: ScanKind,
    pub dt_min: f32,
    pub dt_max: f32,
    pub dt_init_floor: f32,
    pub a_init_range: (f32, f32),
}

impl Default for Mamba2Config {
    fn default() -> Self {
        Self {
            d_model: 256,
            d_state: 128,
            d_conv: 4,
            expand: 2,
            headdim: 64,
            chunk_size: 256,
            d_mlp: 0,
            norm_eps: 1e-5,
            norm_before_gate: true,
            scan: ScanKind::Chunked,
            dt_min: 0.001,
            dt_max: 0.1,
            dt_init_floor: 1e-4,
            a_init_range: (1.0, 1.1),
        }
    }
}

impl Mamba2Config {
    pub fn from_json_file<P: AsRef<std::path::Path>>(p: P) -> Result<Self> {
        let file = std::fs::File::open(p)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn d_inner(&self) -> usize {
        self.expand * self.d_model
    }

    pub fn nheads(&self) -> usize {
        self.d_inner() / self.headdim
    }

    /// Channels going through the depthwise convolution: x, B and C.
    pub fn conv_dim(&self) -> usize {
        self.d_inner() + 2 * self.d_state
    }

    pub fn d_in_proj(&self) -> usize {
        2 * self.d_mlp + 2 * self.d_inner() + 2 * self.d_state + self.nheads()
    }

    /// Number of rows kept in the convolution window between steps.
    pub fn conv_window(&self) -> usize {
        self.d_conv.saturating_sub(1)
    }

    /// Size of the per-sequence ssm state, nheads x headdim x d_state.
    pub fn ssm_state_len(&self) -> usize {
        self.nheads() * self.headdim * self.d_state
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("d_model", self.d_model),
            ("d_state", self.d_state),
            ("d_conv", self.d_conv),
            ("expand", self.expand),
            ("headdim", self.headdim),
            ("chunk_size", self.chunk_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.d_inner() % self.headdim != 0 {
            return Err(Error::InvalidConfig(format!(
                "d_inner {} is not a multiple of headdim {}",
                self.d_inner(),
                self.headdim
            )));
        }
        if !(self.dt_min > 0.0 && self.dt_max >= self.dt_min) {
            return Err(Error::InvalidConfig(format!(
                "expected 0 < dt_min <= dt_max, got {} and {}",
                self.dt_min, self.dt_max
            )));
        }
        if !(self.dt_init_floor > 0.0) {
            return Err(Error::InvalidConfig("dt_init_floor must be positive".to_string()));
        }
        let (a_lo, a_hi) = self.a_init_range;
        if !(a_lo > 0.0 && a_hi >= a_lo) {
            return Err(Error::InvalidConfig(format!(
                "expected 0 < a_init_range.0 <= a_init_range.1, got ({a_lo}, {a_hi})"
            )));
        }
        if !(self.norm_eps >= 0.0) {
            return Err(Error::InvalidConfig("norm_eps must be non-negative".to_string()));
        }
        Ok(())
    }
}
