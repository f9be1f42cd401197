mod scripted;
mod traits;

pub use scripted::{ScriptStep, ScriptedProvider};
pub use traits::*;
