//! # Stage Pipeline
//!
//! A small concurrent dataflow engine: typed stages connected by bounded channels,
//! with terminal statuses flowing back against the data.
//!
//! ## Building Blocks
//!
//! - [`Stage`] - transforms `IN` into routed `OUT` items through a [`Processor`]
//! - [`Source`] / [`Sink`] - stages without input / output
//! - [`link_stages_at`] - wires one output slot to one input slot
//! - [`Pipeline`] - prepares, links and starts a set of stages, and reports their combined status
//!
//! ## Example
//!
//! ```rust,ignore
//! use ctmap_core::pipeline::{link_stages_at, Pipeline, Sink, Source};
//!
//! let source = Source::from_vec("numbers", vec![1u32, 2, 3], |_| Ok(0));
//! let sink = Sink::from_fn("print", |x: u32| { println!("{x}"); Ok(()) });
//! let stages = vec![source.handle(), sink.handle()];
//! let mut pipeline = Pipeline::new(
//!     move || link_stages_at(source.stage(), 0, sink.stage(), 0),
//!     stages,
//! );
//! pipeline.resume()?;
//! pipeline.wait().await?;
//! ```

pub mod error;
pub mod graph;
pub mod join;
pub mod processor;
mod run;
pub mod sink;
pub mod source;
pub mod stage;
pub mod stall;

pub use error::{PipelineError, StageResult};
pub use graph::{LinkFn, Pipeline};
pub use join::join_two_pipelines;
pub use processor::{Flow, FnProcessor, Outputs, Processor};
pub use sink::Sink;
pub use source::Source;
pub use stage::{
    link_stages, link_stages_at, InputPolicy, OutputPolicy, Stage, StageLike, StageState,
    CHANNEL_CAPACITY,
};
pub use stall::StallRole;
