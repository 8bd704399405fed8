//! Presentment orchestration: one call from an authorized presentation
//! request to the response envelope.
//!
//! Everything here is glue over `core`; the caller supplies a request it
//! has already routed, the credential the user picked, and a signer the
//! platform has already authorized (biometric gating and storage live
//! outside this crate).

use crate::core::credential::{CredentialPayload, StoredCredential};
use crate::core::dcql::MatchedClaims;
use crate::core::mdoc;
use crate::core::request::{AuthenticationPrompt, PresentationRequest, PresentationResponse};
use crate::core::sd_jwt::SdJwt;
use crate::core::signer::CredentialSigner;
use anyhow::{bail, Context, Result};
use base64::prelude::*;
use tracing::debug;

/// Builds the presentation response for one selected credential, returning
/// the `vp_token` envelope together with the prompt the platform should
/// have shown (or show) for user approval.
pub fn create_presentation_response(
    request: &PresentationRequest,
    origin: &str,
    credential: &StoredCredential,
    signer: &dyn CredentialSigner,
) -> Result<(PresentationResponse, AuthenticationPrompt)> {
    let query = request.dcql_query();
    let dcql_id = query
        .single()
        .context("unsupported credential query")?
        .id()
        .to_string();
    let matched = query
        .query_credential(credential)
        .context("query does not apply to the selected credential")?;
    let transaction_data = request.matching_transaction_data(&dcql_id);

    let payload = match matched {
        MatchedClaims::Mdoc(required) => {
            let CredentialPayload::Mdoc {
                doc_type,
                issuer_signed,
            } = &credential.payload
            else {
                bail!("matched mdoc claims for a non-mdoc credential");
            };
            let filtered = mdoc::filter_issuer_signed(issuer_signed, &required)
                .context("filtering issuer-signed document")?;
            let handover = request.handover(origin).context("building handover")?;
            let transcript =
                mdoc::session_transcript(handover).context("building session transcript")?;
            let device_response = mdoc::generate_device_response(
                doc_type,
                &filtered,
                signer,
                &transcript,
                &transaction_data.device_namespaces(),
            )
            .context("generating device response")?;
            BASE64_URL_SAFE_NO_PAD.encode(device_response)
        }
        MatchedClaims::SdJwt(selected) => {
            let CredentialPayload::SdJwt { token, .. } = &credential.payload else {
                bail!("matched sd-jwt claims for a non-sd-jwt credential");
            };
            SdJwt::parse(token)
                .context("parsing stored sd-jwt")?
                .verify()
                .context("verifying stored sd-jwt")?
                .present(
                    selected.as_deref(),
                    request.nonce(),
                    request.client_id(),
                    signer,
                )
                .context("presenting sd-jwt")?
        }
    };

    debug!(%dcql_id, "presentation response ready");
    Ok((
        PresentationResponse::new(dcql_id, payload),
        transaction_data.prompt().clone(),
    ))
}
