pub mod chain;
pub mod history;
pub mod session;

pub use chain::{Chain, ChainTreeNode, ChainType};
pub use history::{CompletionHistory, TaskTimeStats};
pub use session::{ActiveSession, ScheduledSession};
