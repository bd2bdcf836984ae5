//! `rtjoint-middleware` – The queues between the control thread and the
//! outside world.
//!
//! The control loop never blocks on either side: inbound commands are
//! drained once per cycle, and outbound events are broadcast into bounded
//! lanes that drop the oldest entries for readers who fall behind.
//!
//! # Modules
//!
//! - [`command`] – [`CommandQueue`][command::CommandQueue]: bounded FIFO of
//!   inbound [`ControlCommand`][rtjoint_types::ControlCommand]s.
//! - [`bus`] – [`EventBus`][bus::EventBus]: topic-based broadcast of safety
//!   events and telemetry built on Tokio broadcast channels.

pub mod bus;
pub mod command;

pub use bus::{EventBus, EventReceiver, Topic};
pub use command::{CommandQueue, CommandReceiver, CommandSender};
