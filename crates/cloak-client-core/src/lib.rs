#![cfg_attr(test, allow(clippy::expect_used))]

pub mod adoption;
pub mod auth;
pub mod deep_link;

pub use adoption::{AdoptionError, AuthState, SessionAdoption};
pub use auth::{
    BackendSession, DecodedAuthData, IdentityBackend, LinkedAccountProfile, UserProfileRow,
    UserRecord, UserRecordStore,
};
pub use deep_link::{AuthLinkPayload, DeepLinkError, LinkRoute, interpret};
