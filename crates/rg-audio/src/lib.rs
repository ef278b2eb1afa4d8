//! rg-audio: real-time audio graph primitives
//!
//! The building blocks every logic core mounts onto:
//! - Passthroughs and valves (gatable passthroughs)
//! - Splitters (fan-out) and priority selectors (fan-in)
//! - Prebuffered elastic FIFOs
//! - Stream-state detectors with hangover
//! - Amplifiers, clippers, limiters
//! - Summing mixer with per-input gain
//! - Real-time pacer
//! - WAV recorder sink
//!
//! Audio flows as pushed blocks of 16 bit mono samples at the internal
//! rate. `flush()` marks end-of-stream; a node must never hold samples
//! past its destruction.

pub mod amp;
pub mod fifo;
pub mod graph;
pub mod mixer;
pub mod pacer;
pub mod recorder;
pub mod selector;
pub mod splitter;
pub mod ssdet;
pub mod valve;

mod error;

pub use amp::{AmplifierSink, ClipperSink, LimiterSink};
pub use error::{AudioError, AudioResult};
pub use fifo::Fifo;
pub use graph::{AudioSink, Collector, NullSink, Passthrough, shared};
pub use mixer::{Mixer, MixerInput};
pub use pacer::Pacer;
pub use recorder::WavRecorderSink;
pub use selector::{Selector, SelectorPort};
pub use splitter::{BranchId, Splitter};
pub use ssdet::{StreamEvent, StreamStateDetector};
pub use valve::Valve;
