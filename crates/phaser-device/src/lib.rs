pub mod config;
pub mod game_loop;
pub mod input;
pub mod optical;
pub mod persist;
pub mod receiver;
pub mod runtime;
pub mod sensor;
pub mod shot;
pub mod sync;
pub mod wireless;

pub use runtime::{Board, DeviceError, ExitReason, RunningDevice, start};
