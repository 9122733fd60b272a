//! Core building blocks.
//!
//! Token signing, identity resolution and the collaborator ports. Nothing in
//! here knows about transports.

pub mod identity;
pub mod store;
pub mod token;

pub use identity::{Capability, IdentityResolver, Principal};
pub use store::{Gender, MessageStore, Role, Storage, StoreError, Translator, UserDirectory, UserRecord};
pub use token::{TokenCodec, TokenConfigError, TokenError};
