//! Credential formats, the candidate store queried during matching, and the
//! wallet-side stored credential handed to the response builders.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

const FORMAT_MSO_MDOC: &str = "mso_mdoc";
const FORMAT_SD_JWT_VC: &str = "dc+sd-jwt";

/// Credential format designation, keyed on the wire by its registered name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CredentialFormat {
    /// ISO/IEC 18013-5 mobile documents (`mso_mdoc`).
    MsoMdoc,
    /// IETF SD-JWT verifiable credentials (`dc+sd-jwt`).
    SdJwtVc,
    /// A format this engine has no special handling for.
    Other(String),
}

impl CredentialFormat {
    pub fn name(&self) -> &str {
        match self {
            Self::MsoMdoc => FORMAT_MSO_MDOC,
            Self::SdJwtVc => FORMAT_SD_JWT_VC,
            Self::Other(name) => name,
        }
    }

    fn from_name(name: Cow<str>) -> Self {
        match name.as_ref() {
            FORMAT_MSO_MDOC => Self::MsoMdoc,
            FORMAT_SD_JWT_VC => Self::SdJwtVc,
            _ => Self::Other(name.into_owned()),
        }
    }
}

impl fmt::Display for CredentialFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for CredentialFormat {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for CredentialFormat {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(Cow::Owned(name)))
    }
}

/// One claim as stored in the candidate store: the value the credential
/// carries plus an optional display label for selection UIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredClaim {
    #[serde(default)]
    pub value: Option<Json>,
    #[serde(default)]
    pub display: Option<String>,
}

/// A candidate mdoc credential in the store.
///
/// `namespaces` maps namespace → claim name → stored claim. `BTreeMap`s keep
/// match results deterministic across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdocCandidate {
    pub id: String,
    #[serde(default)]
    pub namespaces: BTreeMap<String, BTreeMap<String, StoredClaim>>,
}

impl MdocCandidate {
    /// Looks up a claim by namespace and claim name.
    pub fn claim(&self, namespace: &str, claim_name: &str) -> Option<&StoredClaim> {
        self.namespaces.get(namespace)?.get(claim_name)
    }

    /// All (namespace, claim name) pairs the candidate exposes.
    pub fn exposed_claims(&self) -> impl Iterator<Item = (&str, &str)> {
        self.namespaces.iter().flat_map(|(namespace, claims)| {
            claims
                .keys()
                .map(move |claim_name| (namespace.as_str(), claim_name.as_str()))
        })
    }
}

/// The candidate-credential store a DCQL query runs over.
///
/// Wire shape: `{"credentials": {<format>: {<doctype>: [candidate, ...]}}}`.
/// The store is read-only during a match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialStore {
    #[serde(default)]
    credentials: BTreeMap<CredentialFormat, BTreeMap<String, Vec<MdocCandidate>>>,
}

impl CredentialStore {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Candidates stored under `format` in the `bucket` document-type bin.
    /// Missing format or bucket yields an empty slice, not an error.
    pub fn candidates(&self, format: &CredentialFormat, bucket: &str) -> &[MdocCandidate] {
        self.credentials
            .get(format)
            .and_then(|buckets| buckets.get(bucket))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Display metadata attached to a stored wallet credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialDisplay {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    /// Icon reference (data URI or asset name), interpreted by the host.
    #[serde(default)]
    pub icon: Option<String>,
}

/// Format-specific payload of a stored wallet credential.
#[derive(Debug, Clone)]
pub enum CredentialPayload {
    Mdoc {
        doc_type: String,
        /// Codec-encoded issuer-signed document.
        issuer_signed: Vec<u8>,
    },
    SdJwt {
        vct: String,
        /// Compact `~`-separated serialization as issued.
        token: String,
    },
}

/// A credential held by the wallet, as storage hands it to the engine.
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub id: String,
    pub display: CredentialDisplay,
    pub payload: CredentialPayload,
}

impl StoredCredential {
    pub fn format(&self) -> CredentialFormat {
        match &self.payload {
            CredentialPayload::Mdoc { .. } => CredentialFormat::MsoMdoc,
            CredentialPayload::SdJwt { .. } => CredentialFormat::SdJwtVc,
        }
    }
}
