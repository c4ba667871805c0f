pub mod at_session;
pub mod port;

pub use at_session::AtSession;
pub use port::{AtPort, PcmPort};
