//! rawview: raw camera sample viewer
//!
//! Captures frames without RGB conversion, shifts the raw samples left so
//! low-order sensor data becomes visible, and shows the result in a window.

pub mod capture;
pub mod config;
pub mod frame;
pub mod output;
pub mod transform;
pub mod utils;
pub mod viewer;
