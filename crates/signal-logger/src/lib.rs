//! # Mockbus Signal Logger
//!
//! Records signal emissions from observable objects so a test can pop and
//! check them after the code under test has run.
//!
//! Objects embed a [`SignalHub`] and implement [`Observable`]. A
//! [`SignalLogger`] connects to the signals of interest and appends every
//! emission to a FIFO log.

pub mod hub;
pub mod logger;

pub use hub::{split_detail, HandlerId, ObjectId, Observable, SignalHandler, SignalHub};
pub use logger::{Emission, SignalLogger};
