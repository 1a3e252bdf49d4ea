pub mod capture;

pub use capture::{CaptureSet, Frame, ProductInfo};
