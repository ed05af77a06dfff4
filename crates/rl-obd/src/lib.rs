pub mod codec;
pub mod dtc_db;
pub mod elm;
pub mod error;
pub mod mock;
pub mod transport;
pub mod types;

pub use error::{ObdError, ObdResult};
pub use transport::{
    ConnectProgress, ConnectStage, DeviceHandle, ParameterResponses, RawTroubleCode, SessionInfo,
    Transport, TransportFactory,
};
pub use types::{Measurement, UnitSystem};
