//! HTML handling for email and landing-page bodies.

pub mod parser;
pub mod rewriter;

pub use parser::{count_forms, extract_links, is_absolute_http};
pub use rewriter::{append_tracking_pixel, rewrite_form_actions, rewrite_links, TrackingLinks};
