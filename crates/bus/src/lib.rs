//! Message bus boundary for the saga engine.
//!
//! The engine talks to its broker through the [`BusProducer`] port.
//! [`InMemoryBus`] implements it for tests, and [`DeadLetterQueue`]
//! quarantines messages whose processing has permanently failed.

pub mod dead_letter;
pub mod error;
pub mod memory;
pub mod message;
pub mod producer;

pub use dead_letter::DeadLetterQueue;
pub use error::{BusError, Result};
pub use memory::InMemoryBus;
pub use message::{BusMessage, BusMessageBuilder};
pub use producer::BusProducer;
