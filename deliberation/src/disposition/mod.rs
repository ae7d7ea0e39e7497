//! Terminal dispositions handed to downstream routing

pub mod bus;

pub use bus::{
    DispositionBus, DispositionError, DispositionRecord, DispositionResult, DispositionSink,
    SharedDispositionBus,
};
