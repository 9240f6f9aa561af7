//! Error types shared by the whole pipeline.

/// Errors raised by the measurement loop.
///
/// Queue drops are not errors: they are reported through
/// [`crate::queue::Enqueue::Dropped`] and the queue counters.
#[derive(Debug, thiserror::Error)]
pub enum RadarError {
    /// A block's counters cannot be explained by its flow table.
    #[error("switch {switch_id} block {block}: equation system is infeasible ({reason})")]
    Infeasible {
        /// The switch the block belongs to.
        switch_id: usize,
        /// Block index inside the sketch.
        block: usize,
        /// What the solver or the pre-check found.
        reason: String,
    },

    /// A counter with zero packets has flows mapped to it.
    #[error("switch {switch_id} block {block}: empty cell {cell} has {candidates} flows")]
    CorruptBlock {
        /// The switch the block belongs to.
        switch_id: usize,
        /// Block index inside the sketch.
        block: usize,
        /// Offending cell.
        cell: usize,
        /// Number of flows mapped to the empty cell.
        candidates: usize,
    },

    /// The flow table of a block ran out of room during the period.
    #[error("switch {switch_id} block {block}: flow table overflowed ({capacity} entries)")]
    BlockOverflow {
        /// The switch the block belongs to.
        switch_id: usize,
        /// Block index inside the sketch.
        block: usize,
        /// Configured flow table capacity.
        capacity: usize,
    },

    /// A decoded flow has a destination with no route entry.
    #[error("switch {switch_id}: no route for destination {dst}")]
    MissingRoute {
        /// The switch being configured.
        switch_id: usize,
        /// The destination address.
        dst: std::net::Ipv4Addr,
    },

    /// A destination was registered twice with different ports.
    #[error("switch {switch_id}: {dst} routed to port {existing}, not {requested}")]
    RouteConflict {
        /// The switch being configured.
        switch_id: usize,
        /// The destination address.
        dst: std::net::Ipv4Addr,
        /// Port already in the table.
        existing: usize,
        /// Port that was requested.
        requested: usize,
    },

    /// The switch id is not registered.
    #[error("unknown switch {0}")]
    UnknownSwitch(usize),

    /// The port id is not registered on the switch.
    #[error("switch {switch_id}: unknown port {port}")]
    UnknownPort {
        /// The switch.
        switch_id: usize,
        /// The port.
        port: usize,
    },

    /// The equation solver failed for a reason other than infeasibility.
    #[error("solver error: {0}")]
    Solver(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The packet trace could not be read.
    #[error("trace error: {0}")]
    Trace(String),

    /// I/O error while writing output.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// CSV error while writing output.
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl RadarError {
    /// Returns true if the error invalidates a whole decode cycle of a switch.
    pub fn is_fatal_for_cycle(&self) -> bool {
        matches!(
            self,
            Self::Infeasible { .. }
                | Self::CorruptBlock { .. }
                | Self::MissingRoute { .. }
                | Self::Solver(_)
        )
    }
}

/// Result type for the measurement loop.
pub type RadarResult<T> = Result<T, RadarError>;
