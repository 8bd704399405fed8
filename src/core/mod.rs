pub mod cbor;
pub mod credential;
pub mod dcql;
pub mod mdoc;
pub mod request;
pub mod sd_jwt;
pub mod signature;
pub mod signer;
