//! Mamba2 selective state-space layer on plain f32 buffers.
//!
//! A [Mamba2Layer] maps sequences of `d_model` wide vectors to sequences of the same width.
//! [Mamba2Layer::forward] processes whole sequences at once, an [InferenceSession] primes on a
//! known context and then consumes one timestep at a time with matching outputs.
pub mod config;
pub mod conv;
pub mod error;
pub mod layer;
pub mod model;
pub mod scan;
pub mod session;
pub mod weights;

pub use config::Mamba2Config;
pub use error::{Error, Result};
pub use layer::{Mamba2Layer, SequenceBatch};
pub use scan::{Chunked, ScanKind, SelectiveScan, Sequential};
pub use session::{InferenceSession, RecurrentState, SessionPhase};
pub use weights::LayerWeights;
