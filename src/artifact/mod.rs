//! Image artifacts.
//!
//! - [`extract`] - Unpacking or mounting source images, with scoped cleanup
//! - [`iso`] - Composing ISO images from a staging directory
//! - [`filesystem`] - Copy helpers used while staging

pub mod extract;
pub mod filesystem;
pub mod iso;
