// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for DashEvolve
//!
//! Structural and cycle errors abort a single mutation attempt and leave the
//! graph in its last valid state; the search loop is expected to retry with a
//! different mutation choice. Configuration errors indicate a misconfigured
//! search space and are fatal to the run. Evaluation errors describe one
//! failed candidate and are converted into a failed score by the evaluation
//! layer, never into a generation-level failure.

use thiserror::Error;

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the pipeline-graph engine.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// The graph shape is invalid: a dangling parent reference, a duplicate
    /// node id, a missing node, or an operation that would leave a required
    /// graph empty.
    #[error("Invalid graph structure: {message}")]
    Structure {
        /// What is structurally wrong and which node is involved.
        message: String,
    },

    /// A mutation would introduce a cycle. The mutation was aborted and the
    /// graph is unchanged.
    #[error("Connecting '{parent}' as a parent of '{child}' would create a cycle; the mutation was aborted and the graph is unchanged")]
    Cycle {
        /// Operation name of the node proposed as the new parent.
        parent: String,
        /// Operation name of the node that would receive the parent edge.
        child: String,
    },

    /// The search space is misconfigured (for example an empty operation
    /// pool). Fatal to the run: fix the composer requirements.
    #[error("Invalid search-space configuration: {message}. Check the composer requirements passed to the node factory.")]
    Configuration {
        /// What is wrong with the configuration.
        message: String,
    },

    /// Fitting or scoring one candidate failed. Reported per candidate as a
    /// failed score; never aborts the surrounding generation.
    #[error("Candidate evaluation failed: {message}")]
    Evaluation {
        /// Why the candidate could not be evaluated.
        message: String,
    },

    /// An I/O failure while persisting or loading cache/graph state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A value could not be serialized or deserialized.
    #[error("Serialization failed: {message}")]
    Serialization {
        /// What failed to (de)serialize.
        message: String,
    },
}

impl Error {
    pub(crate) fn structure(message: impl Into<String>) -> Self {
        Self::Structure {
            message: message.into(),
        }
    }

    pub(crate) fn cycle(parent: impl Into<String>, child: impl Into<String>) -> Self {
        Self::Cycle {
            parent: parent.into(),
            child: child.into(),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    pub(crate) fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}
