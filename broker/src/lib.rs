pub mod error;
pub mod session;
pub mod supervisor;
pub mod terminal;
pub mod types;

pub use error::BrokerError;
pub use session::BrokerSession;
pub use supervisor::{SessionHealth, SessionSupervisor};
pub use terminal::{Terminal, TerminalApi, TerminalHandle};
