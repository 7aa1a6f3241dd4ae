//! Booking and focus-session state machine.

mod clock;
mod controller;
mod forward_timer;
mod notifier;
mod state;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub(crate) use controller::WriteSet;
pub use controller::{
    AuxiliaryJudgment, GroupStatus, GroupTransition, SessionController, SessionOutcome,
    SessionSweep, StartOutcome, DEFAULT_INTERRUPTION_REASON,
};
pub use forward_timer::{ForwardTimer, ForwardTimerRegistry};
pub use notifier::{LogNotifier, Notifier};
pub use state::{ceil_minutes, SessionSnapshot};
pub use sweeper::Sweeper;
