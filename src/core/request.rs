//! OpenID4VP presentation requests as delivered over the browser Digital
//! Credentials API, plus the response envelope going back.

use crate::core::cbor::{self, tag24, CborError, CborValue};
use crate::core::dcql::DcqlQuery;
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Device namespace carrying transaction-data hashes in an mdoc response.
pub const TRANSACTION_DATA_NAMESPACE: &str = "net.openid.open4vc";
const TRANSACTION_DATA_HASHES: &str = "transaction_data_hashes";
const DC_API_HANDOVER: &str = "OID4VPDCAPIHandover";
const PAYMENT_TITLE: &str = "Confirm transaction";
const DEFAULT_TITLE: &str = "Verify your identity";

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request has no client_id")]
    MissingClientId,
    #[error("request has no nonce")]
    MissingNonce,
    #[error("request has no dcql_query")]
    MissingQuery,
    #[error("transaction_data entry {0} is not base64url-encoded JSON")]
    MalformedTransactionData(usize),
    #[error(transparent)]
    Cbor(#[from] CborError),
}

/// A parsed OpenID4VP presentation request.
#[derive(Debug, Clone)]
pub struct PresentationRequest {
    client_id: String,
    nonce: String,
    dcql_query: DcqlQuery,
    transaction_data: Vec<TransactionData>,
}

impl PresentationRequest {
    pub fn from_json(raw: &str) -> Result<Self, RequestError> {
        #[derive(Deserialize)]
        struct RawRequest {
            client_id: Option<String>,
            nonce: Option<String>,
            dcql_query: Option<DcqlQuery>,
            #[serde(default)]
            transaction_data: Vec<String>,
        }

        let request: RawRequest = serde_json::from_str(raw)?;
        let transaction_data = request
            .transaction_data
            .iter()
            .enumerate()
            .map(|(index, encoded)| TransactionData::decode(index, encoded))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            client_id: request.client_id.ok_or(RequestError::MissingClientId)?,
            nonce: request.nonce.ok_or(RequestError::MissingNonce)?,
            dcql_query: request.dcql_query.ok_or(RequestError::MissingQuery)?,
            transaction_data,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn dcql_query(&self) -> &DcqlQuery {
        &self.dcql_query
    }

    pub fn transaction_data(&self) -> &[TransactionData] {
        &self.transaction_data
    }

    /// The DC-API handover structure binding a session transcript to this
    /// request and the calling origin:
    /// `["OID4VPDCAPIHandover", SHA-256(encode(tag24(encode([client_id,
    /// nonce, origin]))))]`.
    pub fn handover(&self, origin: &str) -> Result<CborValue, RequestError> {
        let info = cbor::encode(&CborValue::Array(vec![
            self.client_id.as_str().into(),
            self.nonce.as_str().into(),
            origin.into(),
        ]))?;
        let hash = Sha256::digest(cbor::encode(&tag24(info))?);
        Ok(CborValue::Array(vec![
            DC_API_HANDOVER.into(),
            CborValue::Bytes(hash.to_vec()),
        ]))
    }

    /// Hashes and prompt strings for the transaction-data entries that name
    /// `dcql_id` in their `credential_ids`.
    pub fn matching_transaction_data(&self, dcql_id: &str) -> TransactionDataResult {
        let mut hashes = Vec::new();
        let mut prompt = AuthenticationPrompt::default();
        for data in &self.transaction_data {
            if !data.mentions(dcql_id) {
                debug!(
                    transaction_type = data.transaction_type(),
                    "transaction data names a different credential"
                );
                continue;
            }
            hashes.push(data.hash());
            if prompt.subtitle.is_none() {
                if let (Some(merchant), Some(amount)) = (&data.merchant_name, &data.amount) {
                    prompt.title = PAYMENT_TITLE.to_string();
                    prompt.subtitle = Some(format!(
                        "Authorize payment of amount {} to {}.",
                        amount_text(amount),
                        merchant
                    ));
                }
            }
        }
        TransactionDataResult { hashes, prompt }
    }
}

/// One transaction-data entry. The encoded form is retained because the
/// hash committed into the response covers the string exactly as received.
#[derive(Debug, Clone)]
pub struct TransactionData {
    encoded: String,
    transaction_type: String,
    credential_ids: Vec<String>,
    merchant_name: Option<String>,
    amount: Option<Json>,
}

impl TransactionData {
    fn decode(index: usize, encoded: &str) -> Result<Self, RequestError> {
        #[derive(Deserialize)]
        struct Fields {
            #[serde(rename = "type")]
            transaction_type: String,
            credential_ids: Vec<String>,
            #[serde(default)]
            merchant_name: Option<String>,
            #[serde(default)]
            amount: Option<Json>,
        }

        let raw = BASE64_URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| RequestError::MalformedTransactionData(index))?;
        let fields: Fields = serde_json::from_slice(&raw)
            .map_err(|_| RequestError::MalformedTransactionData(index))?;
        Ok(Self {
            encoded: encoded.to_string(),
            transaction_type: fields.transaction_type,
            credential_ids: fields.credential_ids,
            merchant_name: fields.merchant_name,
            amount: fields.amount,
        })
    }

    pub fn transaction_type(&self) -> &str {
        &self.transaction_type
    }

    pub fn credential_ids(&self) -> &[String] {
        &self.credential_ids
    }

    /// SHA-256 over the base64url string as it appeared in the request.
    pub fn hash(&self) -> Vec<u8> {
        Sha256::digest(self.encoded.as_bytes()).to_vec()
    }

    fn mentions(&self, dcql_id: &str) -> bool {
        self.credential_ids.iter().any(|id| id == dcql_id)
    }
}

fn amount_text(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// What the user is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticationPrompt {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    subtitle: Option<String>,
}

impl AuthenticationPrompt {
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn subtitle(&self) -> Option<&str> {
        self.subtitle.as_deref()
    }
}

impl Default for AuthenticationPrompt {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            subtitle: None,
        }
    }
}

/// Transaction-data evaluation for one credential: the hashes to embed in
/// the response and the prompt to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDataResult {
    hashes: Vec<Vec<u8>>,
    prompt: AuthenticationPrompt,
}

impl TransactionDataResult {
    pub fn hashes(&self) -> &[Vec<u8>] {
        &self.hashes
    }

    pub fn prompt(&self) -> &AuthenticationPrompt {
        &self.prompt
    }

    /// Device namespaces carrying the hashes, empty when no transaction
    /// data matched.
    pub fn device_namespaces(&self) -> BTreeMap<String, CborValue> {
        let mut namespaces = BTreeMap::new();
        if !self.hashes.is_empty() {
            let hashes = CborValue::Array(
                self.hashes
                    .iter()
                    .map(|hash| CborValue::Bytes(hash.clone()))
                    .collect(),
            );
            namespaces.insert(
                TRANSACTION_DATA_NAMESPACE.to_string(),
                CborValue::Map(vec![(TRANSACTION_DATA_HASHES.into(), hashes)]),
            );
        }
        namespaces
    }
}

/// The `{"vp_token": {<queryId>: <payload>}}` envelope handed back to the
/// platform layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationResponse {
    vp_token: BTreeMap<String, String>,
}

impl PresentationResponse {
    pub fn new(query_id: String, payload: String) -> Self {
        Self {
            vp_token: BTreeMap::from([(query_id, payload)]),
        }
    }

    pub fn vp_token(&self) -> &BTreeMap<String, String> {
        &self.vp_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_json(transaction_data: Json) -> String {
        json!({
            "client_id": "web-origin:https://verifier.example",
            "nonce": "n-0S6_WzA2Mj",
            "dcql_query": {
                "credentials": [{
                    "id": "cred1",
                    "format": "mso_mdoc",
                    "meta": { "doctype_value": "org.iso.18013.5.1.mDL" },
                }]
            },
            "transaction_data": transaction_data,
        })
        .to_string()
    }

    fn encode_transaction(fields: Json) -> String {
        BASE64_URL_SAFE_NO_PAD.encode(fields.to_string())
    }

    #[test]
    fn parses_required_fields() {
        let request = PresentationRequest::from_json(&request_json(json!([]))).unwrap();
        assert_eq!(request.client_id(), "web-origin:https://verifier.example");
        assert_eq!(request.nonce(), "n-0S6_WzA2Mj");
        assert_eq!(request.dcql_query().single().unwrap().id(), "cred1");
        assert!(request.transaction_data().is_empty());
    }

    #[test]
    fn each_missing_field_is_its_own_error() {
        let mut incomplete: Json = serde_json::from_str(&request_json(json!([]))).unwrap();
        incomplete.as_object_mut().unwrap().remove("client_id");
        assert!(matches!(
            PresentationRequest::from_json(&incomplete.to_string()),
            Err(RequestError::MissingClientId)
        ));

        let mut incomplete: Json = serde_json::from_str(&request_json(json!([]))).unwrap();
        incomplete.as_object_mut().unwrap().remove("nonce");
        assert!(matches!(
            PresentationRequest::from_json(&incomplete.to_string()),
            Err(RequestError::MissingNonce)
        ));

        let mut incomplete: Json = serde_json::from_str(&request_json(json!([]))).unwrap();
        incomplete.as_object_mut().unwrap().remove("dcql_query");
        assert!(matches!(
            PresentationRequest::from_json(&incomplete.to_string()),
            Err(RequestError::MissingQuery)
        ));
    }

    #[test]
    fn handover_hashes_the_tagged_origin_info() {
        let request = PresentationRequest::from_json(&request_json(json!([]))).unwrap();
        let handover = request.handover("https://verifier.example").unwrap();

        let info = cbor::encode(&CborValue::Array(vec![
            "web-origin:https://verifier.example".into(),
            "n-0S6_WzA2Mj".into(),
            "https://verifier.example".into(),
        ]))
        .unwrap();
        let expected = Sha256::digest(cbor::encode(&tag24(info)).unwrap());
        assert_eq!(
            handover,
            CborValue::Array(vec![
                "OID4VPDCAPIHandover".into(),
                CborValue::Bytes(expected.to_vec()),
            ])
        );
    }

    #[test]
    fn transaction_hashes_cover_the_encoded_string_as_received() {
        let matching = encode_transaction(json!({
            "type": "qes_authorization",
            "credential_ids": ["cred1"],
        }));
        let other = encode_transaction(json!({
            "type": "qes_authorization",
            "credential_ids": ["someone-else"],
        }));
        let request = PresentationRequest::from_json(&request_json(json!([
            matching.clone(),
            other,
        ])))
        .unwrap();

        let result = request.matching_transaction_data("cred1");
        assert_eq!(result.hashes().len(), 1);
        assert_eq!(
            result.hashes()[0],
            Sha256::digest(matching.as_bytes()).to_vec()
        );
        assert_eq!(result.prompt().title(), "Verify your identity");
        assert_eq!(result.prompt().subtitle(), None);
    }

    #[test]
    fn payment_data_drives_the_prompt() {
        let payment = encode_transaction(json!({
            "type": "payment_confirmation",
            "credential_ids": ["cred1"],
            "merchant_name": "ACME",
            "amount": "25.00 EUR",
        }));
        let request =
            PresentationRequest::from_json(&request_json(json!([payment]))).unwrap();

        let result = request.matching_transaction_data("cred1");
        assert_eq!(result.prompt().title(), "Confirm transaction");
        assert_eq!(
            result.prompt().subtitle(),
            Some("Authorize payment of amount 25.00 EUR to ACME.")
        );
    }

    #[test]
    fn malformed_transaction_data_is_rejected() {
        assert!(matches!(
            PresentationRequest::from_json(&request_json(json!(["!not-base64url!"]))),
            Err(RequestError::MalformedTransactionData(0))
        ));

        let not_json = BASE64_URL_SAFE_NO_PAD.encode("plain text");
        assert!(matches!(
            PresentationRequest::from_json(&request_json(json!([not_json]))),
            Err(RequestError::MalformedTransactionData(0))
        ));
    }

    #[test]
    fn device_namespaces_wrap_hashes_as_byte_strings() {
        let entry = encode_transaction(json!({
            "type": "qes_authorization",
            "credential_ids": ["cred1"],
        }));
        let request =
            PresentationRequest::from_json(&request_json(json!([entry.clone()]))).unwrap();

        let namespaces = request
            .matching_transaction_data("cred1")
            .device_namespaces();
        let payload = &namespaces["net.openid.open4vc"];
        assert_eq!(
            payload,
            &CborValue::Map(vec![(
                "transaction_data_hashes".into(),
                CborValue::Array(vec![CborValue::Bytes(
                    Sha256::digest(entry.as_bytes()).to_vec()
                )]),
            )])
        );

        let empty = request.matching_transaction_data("unrelated");
        assert!(empty.device_namespaces().is_empty());
    }

    #[test]
    fn response_envelope_shape() {
        let response = PresentationResponse::new("cred1".into(), "payload".into());
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "vp_token": { "cred1": "payload" } })
        );
    }
}
