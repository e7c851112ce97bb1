pub mod color;

pub use color::{parse_color, Rgba};
