//! Kindle delivery: session persistence and the Send-to-Kindle web client.

pub mod client;
pub mod session;

pub use client::{DeliveryResult, KindleClient, SendStep};
pub use session::{AuthSession, CookieRecord, SessionStore};
