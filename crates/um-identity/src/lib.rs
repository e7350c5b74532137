//! Identity provider access for user deletion
//!
//! - [`CredentialCache`]: the service account token used for the
//!   Keycloak admin API, refreshed in place
//! - [`TokenMinter`]: short-lived impersonation tokens for calling
//!   downstream services on behalf of the user being deleted
//! - [`KeycloakAdminClient`]: user lookup and removal

pub mod error;
pub mod impersonation;
pub mod keycloak;
pub mod token;

pub use error::{IdentityError, Result};
pub use impersonation::{ImpersonationClaims, ImpersonationToken, RealmAccess, TokenMinter};
pub use keycloak::{DeleteOutcome, KeycloakAdminClient, KeycloakUser, UserDirectory};
pub use token::{CredentialCache, CredentialSettings, ServiceAccessToken};
