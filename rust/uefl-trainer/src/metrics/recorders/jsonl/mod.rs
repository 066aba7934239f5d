//! A recorder that appends metrics and events as JSON lines to a file.

mod dispatcher;
mod models;
mod recorder;

pub(in crate::metrics) use self::{
    dispatcher::{Command, Request},
    models::{Event, Metric},
};
pub use self::{
    dispatcher::Dispatcher,
    models::{Measurement, Tags},
    recorder::Recorder,
};
