//! Drive a multi-line cross-correlator: track a sky target with the delay
//! lines, integrate lag-resolved correlations and emit them as image blocks.

pub mod accumulate;
pub mod array;
pub mod config;
pub mod correlator;
pub mod cycle;
pub mod delay;
pub mod device;
pub mod geometry;
pub mod hardware;
pub mod reader;
pub mod stats;
pub mod write;

use thiserror::Error;

pub use config::{ConfigChange, LineFlags, Observation, Settings};
pub use correlator::Correlator;
pub use device::{ConnectError, Device};
pub use geometry::{BaselineGeometry, SkyDirection};
pub use hardware::{CorrelationPacket, HardwareInfo, Transport};
pub use reader::{Clock, PacketReader, Step, SystemClock};
pub use write::{FitsEncoder, ImageEncoder, IntegrationOutput};

#[derive(Error, Debug)]
pub enum XcError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Cycle(#[from] cycle::CycleError),

    #[error(transparent)]
    Transport(#[from] hardware::TransportError),

    #[error(transparent)]
    Encode(#[from] write::EncodeError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
