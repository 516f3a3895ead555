//! OpenID 2.0 relying party for a web application.
//!
//! Users type an OpenID identifier; the consumer discovers their provider,
//! sends them there, verifies the signed response and maps the verified
//! identity to an admin or node session.

pub mod api;
pub mod config;
pub mod consumer;
pub mod entity;
pub mod error;
pub mod http;
pub mod openid;
pub mod policy;
pub mod projection;
pub mod registration;
pub mod session;
pub mod store;
