pub mod driver;
pub mod flow;
pub mod state;

pub use driver::{Session, SessionContext};
pub use flow::{Flow, FlowOverrides, FlowSpec, HoldPolicy, SendPolicy, SendTicker};
pub use state::{EndReason, SessionOutcome, SessionState};
