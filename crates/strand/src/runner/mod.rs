//! Runner proxy: run starting, upstream stream consumption, interrupts.

pub mod proxy;

pub use proxy::{interrupt_session, start_run};
