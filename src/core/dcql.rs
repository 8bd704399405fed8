//! DCQL, the declarative query language a verifier uses to request
//! credentials and claims.
//!
//! Two evaluation paths exist: [`DcqlQuery::match_credentials`] runs a query
//! over the candidate store to decide which credentials can answer it at
//! all, and [`DcqlQuery::query_credential`] resolves the claims to release
//! from the one credential the holder selected.

use crate::core::credential::{
    CredentialFormat, CredentialPayload, CredentialStore, MdocCandidate, StoredCredential,
};
use crate::core::mdoc::{self, MdocError};
use crate::utils::NonEmptyVec;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DcqlError {
    #[error("a query must contain exactly one credential request, found {0}")]
    UnsupportedQueryCount(usize),
    #[error("claim_sets requires claims to be present")]
    ClaimSetsWithoutClaims,
    #[error("claim_sets matching is not supported")]
    ClaimSetsUnsupported,
    #[error("claim selector {0} names no namespace/claim pair")]
    IncompleteClaimSelector(usize),
    #[error("claim selector {0} has no path")]
    MissingClaimPath(usize),
    #[error("query requests format {requested} but the credential is {actual}")]
    FormatMismatch {
        requested: CredentialFormat,
        actual: CredentialFormat,
    },
    #[error("cannot inspect stored credential: {0}")]
    Credential(#[from] MdocError),
}

/// A DCQL query: `{"credentials": [...]}`.
///
/// The `credentials` array must be non-empty on the wire; the engine
/// currently evaluates exactly one credential request per query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcqlQuery {
    credentials: NonEmptyVec<DcqlCredentialQuery>,
}

impl DcqlQuery {
    pub fn new(credentials: NonEmptyVec<DcqlCredentialQuery>) -> Self {
        Self { credentials }
    }

    pub fn credentials(&self) -> &[DcqlCredentialQuery] {
        self.credentials.as_ref()
    }

    /// The single credential request in scope. Queries carrying more than
    /// one request are a validation error rather than a partial match.
    pub fn single(&self) -> Result<&DcqlCredentialQuery, DcqlError> {
        match self.credentials.as_ref() {
            [one] => Ok(one),
            many => Err(DcqlError::UnsupportedQueryCount(many.len())),
        }
    }

    /// Evaluates the query against the candidate store.
    ///
    /// Returns the matched credentials per query id. An unmatched query
    /// yields an empty list for its id; only structurally invalid queries
    /// produce an error.
    pub fn match_credentials(
        &self,
        store: &CredentialStore,
    ) -> Result<HashMap<String, Vec<MatchedCredential>>, DcqlError> {
        let credential_query = self.single()?;
        let matched = credential_query.match_in_store(store)?;
        debug!(
            id = credential_query.id(),
            matches = matched.len(),
            "evaluated credential query"
        );
        Ok(HashMap::from([(credential_query.id().to_string(), matched)]))
    }

    /// Resolves which claims of an already-selected wallet credential the
    /// query requests.
    pub fn query_credential(
        &self,
        credential: &StoredCredential,
    ) -> Result<MatchedClaims, DcqlError> {
        self.single()?.resolve_claims(credential)
    }
}

/// One credential request within a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcqlCredentialQuery {
    id: String,
    format: CredentialFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<DcqlMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claims: Option<NonEmptyVec<DcqlClaimsQuery>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claim_sets: Option<NonEmptyVec<Vec<String>>>,
}

impl DcqlCredentialQuery {
    pub fn new(id: String, format: CredentialFormat) -> Self {
        Self {
            id,
            format,
            meta: None,
            claims: None,
            claim_sets: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn format(&self) -> &CredentialFormat {
        &self.format
    }

    pub fn meta(&self) -> Option<&DcqlMeta> {
        self.meta.as_ref()
    }

    pub fn set_meta(&mut self, meta: DcqlMeta) {
        self.meta = Some(meta);
    }

    pub fn claims(&self) -> Option<&[DcqlClaimsQuery]> {
        self.claims.as_deref()
    }

    pub fn set_claims(&mut self, claims: NonEmptyVec<DcqlClaimsQuery>) {
        self.claims = Some(claims);
    }

    pub fn claim_sets(&self) -> Option<&[Vec<String>]> {
        self.claim_sets.as_deref()
    }

    /// `claim_sets` is parsed for wire compatibility but its alternative
    /// claim-combination semantics are not evaluated; queries carrying it
    /// are rejected outright.
    fn validate_claim_sets(&self) -> Result<(), DcqlError> {
        if self.claim_sets.is_some() {
            if self.claims.is_none() {
                return Err(DcqlError::ClaimSetsWithoutClaims);
            }
            return Err(DcqlError::ClaimSetsUnsupported);
        }
        Ok(())
    }

    fn match_in_store(
        &self,
        store: &CredentialStore,
    ) -> Result<Vec<MatchedCredential>, DcqlError> {
        self.validate_claim_sets()?;

        // Format-specific identity is mandatory: without meta there is no
        // document-type bucket to search.
        let Some(meta) = self.meta() else {
            debug!(id = self.id(), "query has no meta, nothing can match");
            return Ok(Vec::new());
        };
        if self.format != CredentialFormat::MsoMdoc {
            debug!(format = %self.format, "store matching only covers mdoc credentials");
            return Ok(Vec::new());
        }
        let Some(doctype) = meta.doctype_value() else {
            warn!(id = self.id(), "mdoc query meta has no doctype_value");
            return Ok(Vec::new());
        };

        let mut matched = Vec::new();
        for candidate in store.candidates(&self.format, doctype) {
            match self.match_candidate(candidate)? {
                Some(claims) => matched.push(MatchedCredential {
                    id: candidate.id.clone(),
                    matched_claims: claims,
                }),
                None => debug!(
                    candidate = %candidate.id,
                    "candidate lacks at least one requested claim"
                ),
            }
        }
        Ok(matched)
    }

    /// All-or-nothing claim matching: the candidate is accepted only when
    /// every requested claim is exposed (and value-constrained selectors
    /// also agree on the stored value). Partial matches are discarded.
    fn match_candidate(
        &self,
        candidate: &MdocCandidate,
    ) -> Result<Option<Vec<MatchedClaim>>, DcqlError> {
        let Some(claims) = self.claims() else {
            // No claim constraints: the candidate matches with everything
            // it exposes.
            return Ok(Some(
                candidate
                    .exposed_claims()
                    .map(|(namespace, claim_name)| MatchedClaim {
                        namespace: namespace.to_string(),
                        claim_name: claim_name.to_string(),
                    })
                    .collect(),
            ));
        };

        let mut matched = Vec::with_capacity(claims.len());
        for (index, selector) in claims.iter().enumerate() {
            let (namespace, claim_name) = selector
                .mdoc_claim()
                .ok_or(DcqlError::IncompleteClaimSelector(index))?;
            let Some(stored) = candidate.claim(namespace, claim_name) else {
                continue;
            };
            if let Some(values) = selector.values() {
                if !values.iter().any(|v| Some(v) == stored.value.as_ref()) {
                    continue;
                }
            }
            matched.push(MatchedClaim {
                namespace: namespace.to_string(),
                claim_name: claim_name.to_string(),
            });
        }
        if matched.len() == claims.len() {
            Ok(Some(matched))
        } else {
            Ok(None)
        }
    }

    fn resolve_claims(
        &self,
        credential: &StoredCredential,
    ) -> Result<MatchedClaims, DcqlError> {
        let actual = credential.format();
        if self.format != actual {
            return Err(DcqlError::FormatMismatch {
                requested: self.format.clone(),
                actual,
            });
        }
        self.validate_claim_sets()?;

        match &credential.payload {
            CredentialPayload::Mdoc { issuer_signed, .. } => {
                let exposed = mdoc::issuer_signed_namespaces(issuer_signed)?;
                let Some(claims) = self.claims() else {
                    // Nothing narrows the request: release every element the
                    // document carries.
                    return Ok(MatchedClaims::Mdoc(exposed));
                };

                let mut required: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for (index, selector) in claims.iter().enumerate() {
                    let (namespace, claim_name) = selector
                        .mdoc_claim()
                        .ok_or(DcqlError::IncompleteClaimSelector(index))?;
                    let available = exposed
                        .get(namespace)
                        .is_some_and(|elements| elements.iter().any(|e| e == claim_name));
                    if !available {
                        debug!(namespace, claim_name, "credential does not expose claim");
                        continue;
                    }
                    let entry = required.entry(namespace.to_string()).or_default();
                    if !entry.iter().any(|e| e == claim_name) {
                        entry.push(claim_name.to_string());
                    }
                }
                Ok(MatchedClaims::Mdoc(required))
            }
            CredentialPayload::SdJwt { .. } => {
                let Some(claims) = self.claims() else {
                    return Ok(MatchedClaims::SdJwt(None));
                };
                let paths = claims
                    .iter()
                    .enumerate()
                    .map(|(index, selector)| {
                        selector
                            .path()
                            .map(<[ClaimPathSegment]>::to_vec)
                            .ok_or(DcqlError::MissingClaimPath(index))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(MatchedClaims::SdJwt(Some(paths)))
            }
        }
    }
}

/// Format-specific query metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcqlMeta {
    /// Document-type selector for mdoc queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    doctype_value: Option<String>,
    /// Verifiable-credential-type selector for SD-JWT queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vct_values: Option<Vec<String>>,
}

impl DcqlMeta {
    pub fn for_doctype(doctype: impl Into<String>) -> Self {
        Self {
            doctype_value: Some(doctype.into()),
            vct_values: None,
        }
    }

    pub fn doctype_value(&self) -> Option<&str> {
        self.doctype_value.as_deref()
    }

    pub fn vct_values(&self) -> Option<&[String]> {
        self.vct_values.as_deref()
    }
}

/// One claim selector within a credential request.
///
/// mdoc selectors address claims either through the explicit
/// `namespace`/`claim_name` field pair or through a two-segment `path`;
/// SD-JWT selectors always use `path`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DcqlClaimsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<NonEmptyVec<ClaimPathSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claim_name: Option<String>,
    /// When present, the stored claim value must equal one of these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    values: Option<Vec<Json>>,
}

impl DcqlClaimsQuery {
    pub fn for_mdoc_claim(namespace: impl Into<String>, claim_name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            claim_name: Some(claim_name.into()),
            ..Self::default()
        }
    }

    pub fn for_path(path: NonEmptyVec<ClaimPathSegment>) -> Self {
        Self {
            path: Some(path),
            ..Self::default()
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn path(&self) -> Option<&[ClaimPathSegment]> {
        self.path.as_deref()
    }

    pub fn values(&self) -> Option<&[Json]> {
        self.values.as_deref()
    }

    /// The namespace + claim-name pair an mdoc selector addresses.
    pub fn mdoc_claim(&self) -> Option<(&str, &str)> {
        if let (Some(namespace), Some(claim_name)) = (&self.namespace, &self.claim_name) {
            return Some((namespace, claim_name));
        }
        match self.path.as_deref() {
            Some([ClaimPathSegment::String(namespace), ClaimPathSegment::String(claim_name)]) => {
                Some((namespace, claim_name))
            }
            _ => None,
        }
    }
}

/// One segment of a claims path: an object key, a `null` wildcard selecting
/// every element of an array, or a single array index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimPathSegment {
    String(String),
    Null,
    Integer(usize),
}

/// A full claims path, root to claim.
pub type ClaimPath = Vec<ClaimPathSegment>;

/// A claim matched on a store candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedClaim {
    pub namespace: String,
    pub claim_name: String,
}

/// A store candidate that satisfied every requested claim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedCredential {
    pub id: String,
    pub matched_claims: Vec<MatchedClaim>,
}

/// Claims of a selected wallet credential that a query requests, in the
/// shape the respective response builder consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchedClaims {
    /// Namespace → element identifiers to retain in the issuer-signed
    /// document.
    Mdoc(BTreeMap<String, Vec<String>>),
    /// Claim paths to disclose; `None` discloses everything.
    SdJwt(Option<Vec<ClaimPath>>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cbor::{self, tag24, CborValue};
    use crate::core::credential::CredentialDisplay;
    use serde_json::json;

    fn store() -> CredentialStore {
        CredentialStore::from_json(
            &json!({
                "credentials": {
                    "mso_mdoc": {
                        "org.iso.18013.5.1.mDL": [{
                            "id": "mdl-1",
                            "namespaces": {
                                "org.iso.18013.5.1": {
                                    "given_name": { "value": "Erika", "display": "Given Name" },
                                    "family_name": { "value": "Mustermann", "display": "Family Name" }
                                }
                            }
                        }]
                    }
                }
            })
            .to_string(),
        )
        .unwrap()
    }

    fn mdl_query(claims: Json) -> DcqlQuery {
        serde_json::from_value(json!({
            "credentials": [{
                "id": "cred1",
                "format": "mso_mdoc",
                "meta": { "doctype_value": "org.iso.18013.5.1.mDL" },
                "claims": claims,
            }]
        }))
        .unwrap()
    }

    fn element(identifier: &str) -> CborValue {
        tag24(
            cbor::encode(&CborValue::Map(vec![
                ("elementIdentifier".into(), identifier.into()),
                ("elementValue".into(), "v".into()),
            ]))
            .unwrap(),
        )
    }

    fn stored_mdl() -> StoredCredential {
        let namespaces = CborValue::Map(vec![(
            "org.iso.18013.5.1".into(),
            CborValue::Array(vec![element("given_name"), element("family_name")]),
        )]);
        let issuer_signed = cbor::encode(&CborValue::Map(vec![(
            "nameSpaces".into(),
            namespaces,
        )]))
        .unwrap();
        StoredCredential {
            id: "wallet-mdl".into(),
            display: CredentialDisplay::default(),
            payload: CredentialPayload::Mdoc {
                doc_type: "org.iso.18013.5.1.mDL".into(),
                issuer_signed,
            },
        }
    }

    #[test]
    fn query_parsing_round_trips() {
        let query = mdl_query(json!([
            { "namespace": "org.iso.18013.5.1", "claim_name": "given_name" },
            { "path": ["org.iso.18013.5.1", "family_name"] },
        ]));
        let round_tripped: DcqlQuery =
            serde_json::from_value(serde_json::to_value(&query).unwrap()).unwrap();
        assert_eq!(round_tripped, query);

        let request = query.single().unwrap();
        assert_eq!(request.id(), "cred1");
        assert_eq!(request.format(), &CredentialFormat::MsoMdoc);
        let claims = request.claims().unwrap();
        assert_eq!(
            claims[0].mdoc_claim(),
            Some(("org.iso.18013.5.1", "given_name"))
        );
        assert_eq!(
            claims[1].mdoc_claim(),
            Some(("org.iso.18013.5.1", "family_name"))
        );
    }

    #[test]
    fn path_segments_parse_all_forms() {
        let segments: Vec<ClaimPathSegment> =
            serde_json::from_value(json!(["address", null, 2])).unwrap();
        assert_eq!(
            segments,
            vec![
                ClaimPathSegment::String("address".into()),
                ClaimPathSegment::Null,
                ClaimPathSegment::Integer(2),
            ]
        );
    }

    #[test]
    fn empty_credentials_array_is_rejected_at_parse() {
        assert!(serde_json::from_value::<DcqlQuery>(json!({ "credentials": [] })).is_err());
    }

    #[test]
    fn multiple_credential_requests_are_a_validation_error() {
        let query: DcqlQuery = serde_json::from_value(json!({
            "credentials": [
                { "id": "a", "format": "mso_mdoc" },
                { "id": "b", "format": "mso_mdoc" },
            ]
        }))
        .unwrap();
        assert!(matches!(
            query.match_credentials(&store()),
            Err(DcqlError::UnsupportedQueryCount(2))
        ));
    }

    #[test]
    fn matches_candidate_exposing_all_requested_claims() {
        let query = mdl_query(json!([
            { "namespace": "org.iso.18013.5.1", "claim_name": "given_name" },
            { "namespace": "org.iso.18013.5.1", "claim_name": "family_name" },
        ]));
        let results = query.match_credentials(&store()).unwrap();
        let matched = &results["cred1"];
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "mdl-1");
        assert_eq!(matched[0].matched_claims.len(), 2);
    }

    #[test]
    fn partial_claim_coverage_yields_no_match() {
        let query = mdl_query(json!([
            { "namespace": "org.iso.18013.5.1", "claim_name": "given_name" },
            { "namespace": "org.iso.18013.5.1", "claim_name": "portrait" },
        ]));
        let results = query.match_credentials(&store()).unwrap();
        assert!(results["cred1"].is_empty());
    }

    #[test]
    fn claims_absent_matches_with_all_exposed_claims() {
        let query: DcqlQuery = serde_json::from_value(json!({
            "credentials": [{
                "id": "cred1",
                "format": "mso_mdoc",
                "meta": { "doctype_value": "org.iso.18013.5.1.mDL" },
            }]
        }))
        .unwrap();
        let results = query.match_credentials(&store()).unwrap();
        let matched = &results["cred1"];
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].matched_claims.len(), 2);
    }

    #[test]
    fn value_constraints_must_agree_with_the_store() {
        let matching = mdl_query(json!([
            { "namespace": "org.iso.18013.5.1", "claim_name": "given_name", "values": ["Erika", "Max"] },
        ]));
        assert_eq!(matching.match_credentials(&store()).unwrap()["cred1"].len(), 1);

        let conflicting = mdl_query(json!([
            { "namespace": "org.iso.18013.5.1", "claim_name": "given_name", "values": ["Max"] },
        ]));
        assert!(conflicting.match_credentials(&store()).unwrap()["cred1"].is_empty());
    }

    #[test]
    fn missing_meta_or_unknown_doctype_yields_zero_matches() {
        let no_meta: DcqlQuery = serde_json::from_value(json!({
            "credentials": [{ "id": "cred1", "format": "mso_mdoc" }]
        }))
        .unwrap();
        assert!(no_meta.match_credentials(&store()).unwrap()["cred1"].is_empty());

        let unknown: DcqlQuery = serde_json::from_value(json!({
            "credentials": [{
                "id": "cred1",
                "format": "mso_mdoc",
                "meta": { "doctype_value": "org.example.unknown" },
            }]
        }))
        .unwrap();
        assert!(unknown.match_credentials(&store()).unwrap()["cred1"].is_empty());
    }

    #[test]
    fn claim_sets_are_structurally_validated_and_unsupported() {
        let without_claims: DcqlQuery = serde_json::from_value(json!({
            "credentials": [{
                "id": "cred1",
                "format": "mso_mdoc",
                "meta": { "doctype_value": "org.iso.18013.5.1.mDL" },
                "claim_sets": [["a"]],
            }]
        }))
        .unwrap();
        assert!(matches!(
            without_claims.match_credentials(&store()),
            Err(DcqlError::ClaimSetsWithoutClaims)
        ));

        let with_claims: DcqlQuery = serde_json::from_value(json!({
            "credentials": [{
                "id": "cred1",
                "format": "mso_mdoc",
                "meta": { "doctype_value": "org.iso.18013.5.1.mDL" },
                "claims": [{ "id": "a", "namespace": "ns", "claim_name": "n" }],
                "claim_sets": [["a"]],
            }]
        }))
        .unwrap();
        assert!(matches!(
            with_claims.match_credentials(&store()),
            Err(DcqlError::ClaimSetsUnsupported)
        ));
    }

    #[test]
    fn query_credential_restricts_to_requested_mdoc_claims() {
        let query = mdl_query(json!([
            { "namespace": "org.iso.18013.5.1", "claim_name": "given_name" },
            { "path": ["org.iso.18013.5.1", "nonexistent"] },
        ]));
        let MatchedClaims::Mdoc(required) =
            query.query_credential(&stored_mdl()).unwrap()
        else {
            panic!("expected mdoc claims");
        };
        assert_eq!(required.len(), 1);
        assert_eq!(required["org.iso.18013.5.1"], ["given_name"]);
    }

    #[test]
    fn query_credential_without_claims_releases_everything() {
        let query: DcqlQuery = serde_json::from_value(json!({
            "credentials": [{
                "id": "cred1",
                "format": "mso_mdoc",
                "meta": { "doctype_value": "org.iso.18013.5.1.mDL" },
            }]
        }))
        .unwrap();
        let MatchedClaims::Mdoc(required) =
            query.query_credential(&stored_mdl()).unwrap()
        else {
            panic!("expected mdoc claims");
        };
        assert_eq!(required["org.iso.18013.5.1"], ["given_name", "family_name"]);
    }

    #[test]
    fn query_credential_rejects_format_mismatch() {
        let query: DcqlQuery = serde_json::from_value(json!({
            "credentials": [{ "id": "cred1", "format": "dc+sd-jwt" }]
        }))
        .unwrap();
        assert!(matches!(
            query.query_credential(&stored_mdl()),
            Err(DcqlError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn query_credential_collects_sd_jwt_paths() {
        let credential = StoredCredential {
            id: "wallet-pid".into(),
            display: CredentialDisplay::default(),
            payload: CredentialPayload::SdJwt {
                vct: "urn:eu.europa.ec.eudi:pid:1".into(),
                token: "unused-here".into(),
            },
        };

        let query: DcqlQuery = serde_json::from_value(json!({
            "credentials": [{
                "id": "cred1",
                "format": "dc+sd-jwt",
                "claims": [
                    { "path": ["given_name"] },
                    { "path": ["address", "street_address"] },
                ],
            }]
        }))
        .unwrap();
        let MatchedClaims::SdJwt(Some(paths)) =
            query.query_credential(&credential).unwrap()
        else {
            panic!("expected sd-jwt paths");
        };
        assert_eq!(paths.len(), 2);
        assert_eq!(
            paths[1],
            vec![
                ClaimPathSegment::String("address".into()),
                ClaimPathSegment::String("street_address".into()),
            ]
        );

        let unconstrained: DcqlQuery = serde_json::from_value(json!({
            "credentials": [{ "id": "cred1", "format": "dc+sd-jwt" }]
        }))
        .unwrap();
        assert_eq!(
            unconstrained.query_credential(&credential).unwrap(),
            MatchedClaims::SdJwt(None)
        );
    }
}
