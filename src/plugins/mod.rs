// Plugin infrastructure for conductor

pub mod callbacks;

pub use callbacks::{CallbackManager, CallbackPlugin, JsonLogCallback};
