//! Small helpers shared by the dispatcher and the tracking server.

pub mod token;
pub mod user_agent;

pub use token::mint_token;
pub use user_agent::{parse_user_agent, ParsedAgent};
