/// Helpers for encoding and framing JPEG data.
pub mod image;
/// Test fixture macros.
pub mod tests;
