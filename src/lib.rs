//! Credential protocol engine for a digital-identity wallet.
//!
//! This library implements the protocol core a wallet needs to answer an
//! OpenID4VP presentation request delivered over the browser Digital
//! Credentials API: a compact CBOR codec, an mdoc device-response builder,
//! an SD-JWT verifier/presenter, and a DCQL matcher. Everything around it
//! (credential storage, user consent, biometric gating, network transport)
//! is the embedding application's concern; the engine only consumes a
//! private-key capability the platform has already authorized.
//!
//! # Presentation flow
//!
//! 1. *Parse the request*: [`PresentationRequest::from_json`] validates the
//!    OpenID4VP payload (`client_id`, `nonce`, `dcql_query`, optional
//!    `transaction_data`).
//! 2. *Match credentials*: [`DcqlQuery::match_credentials`] evaluates the
//!    query against a [`CredentialStore`] and reports, per query id, the
//!    candidates that can satisfy every requested claim.
//! 3. *Build the response*: once the user picks a credential and the
//!    platform authorizes its key, [`create_presentation_response`] filters
//!    the claims, signs the session binding, and returns the
//!    `{"vp_token": {...}}` envelope plus the approval prompt.
//!
//! ```ignore
//! use wallet_engine::core::credential::CredentialStore;
//! use wallet_engine::core::request::PresentationRequest;
//! use wallet_engine::presentment::create_presentation_response;
//!
//! let request = PresentationRequest::from_json(&raw_request)?;
//! let matches = request.dcql_query().match_credentials(&store)?;
//!
//! // ... the user selects a credential, the platform authorizes its key ...
//!
//! let (response, prompt) =
//!     create_presentation_response(&request, origin, &credential, &signer)?;
//! ```
//!
//! # Credential formats
//!
//! Two formats are supported end to end:
//! - **mso_mdoc**: ISO 18013-5 mobile documents. The response is a CBOR
//!   device response carrying a namespace-filtered issuer-signed block and a
//!   freshly signed device-signed block ([`core::mdoc`]).
//! - **dc+sd-jwt**: IETF SD-JWT verifiable credentials. The response is a
//!   compact presentation carrying the selected disclosures and a
//!   key-binding JWT ([`core::sd_jwt`]).
//!
//! Queries are expressed in DCQL, the native query language of OpenID4VP;
//! see [`core::dcql`] for matching semantics and the claim-path model.
//!
//! [`PresentationRequest::from_json`]: core::request::PresentationRequest::from_json
//! [`DcqlQuery::match_credentials`]: core::dcql::DcqlQuery::match_credentials
//! [`CredentialStore`]: core::credential::CredentialStore
//! [`create_presentation_response`]: presentment::create_presentation_response

pub mod core;
pub mod presentment;
pub mod utils;
