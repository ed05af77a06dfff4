pub mod connection;
pub mod dtc;
pub mod parameter;
pub mod session;
pub mod telemetry;

pub use connection::*;
pub use dtc::*;
pub use parameter::*;
pub use session::*;
pub use telemetry::*;
