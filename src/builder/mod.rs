//! Builder worker invocation: parallel dispatch, subprocess lifecycle,
//! STATE.json harvesting, and the violation fix loop.

pub mod dispatcher;
pub mod fix;

pub use dispatcher::{BuilderDispatcher, FILTERED_ENV_KEYS, filtered_env, parse_builder_state};
pub use fix::FixLoop;
