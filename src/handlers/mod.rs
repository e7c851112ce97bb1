pub mod things_handler;

pub use things_handler::{Thing, ThingError, ThingsHandler, THINGS_NAMESPACE};
