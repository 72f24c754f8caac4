pub mod cancel;
pub mod encryption;
pub mod event_bus;
pub mod keystore_v3;
pub mod logging;
pub mod pbkdf2;
pub mod persistence;
pub mod retry;
pub mod rpc_client;
pub mod rpc_validator;
