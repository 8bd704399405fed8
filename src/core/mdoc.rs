//! mdoc issuer-signed document filtering and device-response generation.
//!
//! Builds the ISO/IEC 18013-5 presentation structures used by the browser
//! Digital Credentials API flow: the session transcript, a namespace-filtered
//! copy of the stored issuer-signed document, and the signed `DeviceResponse`
//! that proves possession of the device key for this session.

use crate::core::cbor::{self, tag24, CborError, CborValue, TAG_ENCODED_CBOR};
use crate::core::signature::{der_to_raw, SignatureError};
use crate::core::signer::{CredentialSigner, SigningError};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

const NAME_SPACES: &str = "nameSpaces";
const ELEMENT_IDENTIFIER: &str = "elementIdentifier";

/// COSE algorithm identifier for ES256, as the protected header `{1: -7}`.
const COSE_ALG_ES256: i64 = -7;

#[derive(Debug, Error)]
pub enum MdocError {
    #[error(transparent)]
    Cbor(#[from] CborError),
    #[error("issuer-signed document has no nameSpaces map")]
    MissingNameSpaces,
    #[error("namespace key is not a text string")]
    NonTextNamespace,
    #[error("namespace {0} is not an array of elements")]
    MalformedNamespace(String),
    #[error("element in namespace {0} is not an embedded map with an elementIdentifier")]
    MalformedElement(String),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

/// Builds the session transcript for a browser-API presentation:
/// `[null, null, handover]`, wrapped as embedded CBOR (tag 24).
///
/// The two nulls stand for the device- and reader-engagement structures,
/// which have no equivalent in the browser flow.
pub fn session_transcript(handover: CborValue) -> Result<Vec<u8>, MdocError> {
    let transcript = CborValue::Array(vec![CborValue::Null, CborValue::Null, handover]);
    Ok(cbor::encode(&tag24(cbor::encode(&transcript)?))?)
}

/// Produces a filtered copy of an issuer-signed document that retains only
/// the requested elements.
///
/// For each requested namespace, elements whose decoded `elementIdentifier`
/// is in the requested set are kept in their original order; namespaces with
/// nothing retained are dropped. Every other top-level field is carried over
/// untouched, and the `nameSpaces` entry keeps its position in the document
/// map. The input is never modified.
pub fn filter_issuer_signed(
    issuer_signed: &[u8],
    required: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<u8>, MdocError> {
    let document = cbor::decode(issuer_signed)?;
    let entries = document.as_map().ok_or(MdocError::MissingNameSpaces)?;
    let namespaces = document.get(NAME_SPACES).ok_or(MdocError::MissingNameSpaces)?;

    let mut filtered: Vec<(CborValue, CborValue)> = Vec::new();
    for (namespace, requested) in required {
        let Some(available) = namespaces.get(namespace) else {
            debug!(namespace, "document does not carry a requested namespace");
            continue;
        };
        let available = available
            .as_array()
            .ok_or_else(|| MdocError::MalformedNamespace(namespace.clone()))?;

        let mut retained = Vec::new();
        for element in available {
            if let Some(identifier) = element_identifier(element, namespace)? {
                if requested.iter().any(|r| *r == identifier) {
                    retained.push(element.clone());
                }
            }
        }
        if !retained.is_empty() {
            filtered.push((CborValue::Text(namespace.clone()), CborValue::Array(retained)));
        }
    }

    let filtered = CborValue::Map(filtered);
    let rebuilt: Vec<(CborValue, CborValue)> = entries
        .iter()
        .map(|(key, value)| {
            if key.as_text() == Some(NAME_SPACES) {
                (key.clone(), filtered.clone())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect();
    Ok(cbor::encode(&CborValue::Map(rebuilt))?)
}

/// Enumerates the namespaces and element identifiers an issuer-signed
/// document exposes, preserving document order within each namespace.
pub fn issuer_signed_namespaces(
    issuer_signed: &[u8],
) -> Result<BTreeMap<String, Vec<String>>, MdocError> {
    let document = cbor::decode(issuer_signed)?;
    let namespaces = document
        .get(NAME_SPACES)
        .and_then(CborValue::as_map)
        .ok_or(MdocError::MissingNameSpaces)?;

    let mut exposed = BTreeMap::new();
    for (namespace, elements) in namespaces {
        let namespace = namespace.as_text().ok_or(MdocError::NonTextNamespace)?;
        let elements = elements
            .as_array()
            .ok_or_else(|| MdocError::MalformedNamespace(namespace.to_string()))?;
        let mut identifiers = Vec::new();
        for element in elements {
            if let Some(identifier) = element_identifier(element, namespace)? {
                identifiers.push(identifier);
            }
        }
        exposed.insert(namespace.to_string(), identifiers);
    }
    Ok(exposed)
}

/// Decodes the `elementIdentifier` of a tag-24 element. Entries that are not
/// tag-24 wrapped are skipped (`None`), matching how issued documents are
/// traversed elsewhere; a tagged entry that does not contain an identifier
/// map is malformed.
fn element_identifier(element: &CborValue, namespace: &str) -> Result<Option<String>, MdocError> {
    let CborValue::Tag(tag, inner) = element else {
        return Ok(None);
    };
    if *tag != TAG_ENCODED_CBOR {
        return Ok(None);
    }
    let embedded = inner
        .as_bytes()
        .ok_or_else(|| MdocError::MalformedElement(namespace.to_string()))?;
    cbor::decode(embedded)?
        .get(ELEMENT_IDENTIFIER)
        .and_then(CborValue::as_text)
        .map(str::to_string)
        .ok_or_else(|| MdocError::MalformedElement(namespace.to_string()))
        .map(Some)
}

/// Assembles and signs the `DeviceResponse` for one document.
///
/// `device_namespaces` carries any device-signed claims (for example
/// transaction-data hashes) and may be empty. The device key signs the COSE
/// `Sig_structure` over the tag-24-wrapped `DeviceAuthentication` payload
/// binding the session transcript, document type and device namespaces.
pub fn generate_device_response(
    doc_type: &str,
    issuer_signed: &[u8],
    device_key: &dyn CredentialSigner,
    session_transcript: &[u8],
    device_namespaces: &BTreeMap<String, CborValue>,
) -> Result<Vec<u8>, MdocError> {
    // Round-trip the issuer-signed input so malformed documents fail here
    // rather than producing an undecodable response.
    let issuer_signed = cbor::decode(issuer_signed)?;

    let namespaces_map = CborValue::Map(
        device_namespaces
            .iter()
            .map(|(key, value)| (CborValue::Text(key.clone()), value.clone()))
            .collect(),
    );
    let device_namespaces_tag = tag24(cbor::encode(&namespaces_map)?);

    let device_authentication = CborValue::Array(vec![
        "DeviceAuthentication".into(),
        CborValue::Bytes(session_transcript.to_vec()),
        doc_type.into(),
        CborValue::Bytes(cbor::encode(&device_namespaces_tag)?),
    ]);
    let device_authentication_bytes =
        cbor::encode(&tag24(cbor::encode(&device_authentication)?))?;

    let protected = cbor::encode(&CborValue::Map(vec![(
        CborValue::Int(1),
        CborValue::Int(COSE_ALG_ES256),
    )]))?;

    let sig_structure = CborValue::Array(vec![
        "Signature1".into(),
        CborValue::Bytes(protected.clone()),
        CborValue::Bytes(Vec::new()),
        CborValue::Bytes(device_authentication_bytes),
    ]);
    let der = device_key.sign(&cbor::encode(&sig_structure)?)?;
    let raw_signature = der_to_raw(&der)?;

    let device_signature = CborValue::Array(vec![
        CborValue::Bytes(protected),
        CborValue::Map(Vec::new()),
        CborValue::Null,
        CborValue::Bytes(raw_signature.to_vec()),
    ]);
    let device_signed = CborValue::Map(vec![
        (NAME_SPACES.into(), device_namespaces_tag),
        (
            "deviceAuth".into(),
            CborValue::Map(vec![("deviceSignature".into(), device_signature)]),
        ),
    ]);

    let document = CborValue::Map(vec![
        ("docType".into(), doc_type.into()),
        ("issuerSigned".into(), issuer_signed),
        ("deviceSigned".into(), device_signed),
    ]);
    let response = CborValue::Map(vec![
        ("version".into(), "1.0".into()),
        ("documents".into(), CborValue::Array(vec![document])),
        ("status".into(), CborValue::Int(0)),
    ]);
    Ok(cbor::encode(&response)?)
}
