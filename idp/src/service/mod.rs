//! # Service Layer
//!
//! Business logic sits here, between the API/gRPC layer and the
//! [`fedid_core::storage`] abstraction. Each service is generic over the
//! storage backend (`S: ... + ?Sized`) and is constructed once in
//! `main.rs`, then shared across handlers behind an `Arc`.
//!
//! | Service | Component | Responsibility |
//! |---------|-----------|-----------------|
//! | [`authorization::AuthorizationService`] | C6 | Authorization-code state machine: validation, connector dispatch, consent, code/token issuance |
//! | [`refresh::RefreshTokenService`] | C7 | Refresh-token issuance, rotation, theft detection, revocation |
//! | [`password::PasswordService`] | C8 | Local credential hashing/verification |
//! | [`device::DeviceFlowService`] | RFC 8628 | Device-authorization grant: device_code/user_code issuance, verification-page approval, polling |

pub mod authorization;
pub mod device;
pub mod password;
pub mod refresh;

pub use authorization::AuthorizationService;
pub use device::DeviceFlowService;
pub use password::PasswordService;
pub use refresh::RefreshTokenService;
