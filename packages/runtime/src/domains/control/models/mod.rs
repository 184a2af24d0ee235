pub mod runtime_control;

pub use runtime_control::{PauseMode, RuntimeControl};
