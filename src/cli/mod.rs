pub mod ascii_preview;
pub mod visualization;

pub use ascii_preview::{AsciiRenderer, clear_screen, check_for_escape};
pub use visualization::Visualizer;
