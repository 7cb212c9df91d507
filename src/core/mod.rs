//! Chat engine plumbing: sessions, the reflection loop, captured IO and the
//! confirmation gate.

pub mod capture;
pub mod confirm;
pub mod engine;
pub mod events;
pub mod reflection;
pub mod remote;
pub mod session;
