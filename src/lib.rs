//! MatrixRadar: sketch based per-flow measurement that feeds a two-class
//! (mice / elephant) queue controller.
//!
//! ```text
//! packets -> SketchEncoder -> SketchDecoder -> QueueController -> DiffQueue
//!            (per switch)     (per period)     (per cycle)        (per port)
//! ```

pub mod bloom_filter;
pub mod cms;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod flow;
pub mod hashing;
pub mod output;
pub mod queue;
pub mod sim;
pub mod solver;
pub mod trace;

pub use config::RadarConfig;
pub use controller::{ControllerReport, PortStats, QueueController};
pub use decoder::{DecodedBatch, SketchDecoder};
pub use encoder::{SharedEncoder, SketchEncoder, SketchSnapshot};
pub use error::{RadarError, RadarResult};
pub use flow::{CounterCell, DecodedFlow, FlowKey, FlowStats};
pub use queue::{DiffQueue, DropReason, Enqueue, QueueStats};
