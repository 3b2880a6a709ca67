//! Image reference, digest, list-format and platform models

pub mod digest;
pub mod list;
pub mod platform;
pub mod reference;

pub use digest::ImageDigest;
pub use list::ListFormat;
pub use platform::Platform;
pub use reference::ImageReference;
