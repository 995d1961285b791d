pub mod citations;
pub mod conversation;
pub mod detector;
pub mod registry;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use citations::clean_citations;
pub use conversation::{ChatOptions, RecoverTarget};
pub use detector::{AnswerSource, CompletionDetector, Detection, Observation, Phase, TabAnswer};
pub use registry::{sanitize_topic, SessionRegistry, SessionTab};
pub use supervisor::{Supervisor, TaskOptions};
