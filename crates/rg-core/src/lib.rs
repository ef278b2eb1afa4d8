//! rg-core: shared foundation for the RigForge voice services runtime
//!
//! - `Sample` type and internal sample rate constants
//! - Configuration store with change notification
//! - Monotonic clock abstraction and one-shot/periodic timers
//! - Receiver/transmitter seams towards the radio hardware drivers
//! - State event and event loop message types

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod sample;
pub mod timer;
pub mod trx;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, SharedConfig};
pub use error::{CoreError, CoreResult};
pub use events::{LoopMessage, StateEvent};
pub use sample::{INTERNAL_SAMPLE_RATE, Sample};
pub use timer::{Timer, earliest_deadline};
pub use trx::{NullRx, NullTx, Receiver, RxEvent, Transmitter, TxCtrlMode};
