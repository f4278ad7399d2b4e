pub mod auth_store;

pub use auth_store::{AuthStateStore, AuthStoreError, Credentials};
