//! `LifecycleEngine`: one long-lived worker task per program, driving it
//! through the state graph.

mod engine;
mod worker;

pub use engine::{LifecycleCommand, LifecycleEngine};
