#[cfg(feature = "cask-base")]
pub use cask_base as base;

#[cfg(feature = "cask-loader")]
pub use cask_loader as loader;
