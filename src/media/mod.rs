//! Product image persistence

mod image;

pub use image::{ImageError, ImageSaver};
