//! SD-JWT verification and presentation.
//!
//! A token moves through three states: parsed ([`SdJwt::parse`] splits the
//! compact serialization), verified ([`SdJwt::verify`] reconciles digests
//! with disclosures and reconstructs the claim tree), and presented
//! ([`VerifiedSdJwt::present`] reserializes the token with a claim subset
//! and a fresh key-binding JWT).
//!
//! Verification here is structural: header, required claims, and the
//! digest/disclosure invariants. The issuer signature is checked separately
//! by [`SdJwt::verify_signature`] against a caller-supplied key, since
//! trust-anchor resolution belongs to the platform layer.

use crate::core::dcql::{ClaimPath, ClaimPathSegment};
use crate::core::signature::{self, SignatureError};
use crate::core::signer::{CredentialSigner, SigningError};
use base64::prelude::*;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde_json::{json, Map, Value as Json};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// `typ` of an issuer-signed SD-JWT verifiable credential.
pub const SD_JWT_TYP: &str = "dc+sd-jwt";
/// `typ` of a key-binding JWT.
pub const KEY_BINDING_TYP: &str = "kb+jwt";

const ES256: &str = "ES256";
const SD_KEY: &str = "_sd";
const SD_ALG_KEY: &str = "_sd_alg";
const SHA_256_ALG: &str = "sha-256";
const ARRAY_MARKER_KEY: &str = "...";

#[derive(Debug, Error)]
pub enum SdJwtError {
    #[error("token has no issuer-signed JWT")]
    MissingIssuerJwt,
    #[error("issuer JWT is not a three-segment compact JWS")]
    MalformedJwt,
    #[error("segment is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("segment is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected typ dc+sd-jwt, found {0:?}")]
    UnexpectedType(Option<String>),
    #[error("expected alg ES256, found {0:?}")]
    UnsupportedAlgorithm(Option<String>),
    #[error("missing required claim {0}")]
    MissingClaim(&'static str),
    #[error("unsupported _sd_alg {0}")]
    UnsupportedSdAlg(Json),
    #[error("_sd must be an array of digest strings")]
    MalformedSdArray,
    #[error("disclosure {0} is not a well-formed salt/name/value array")]
    MalformedDisclosure(String),
    #[error("disclosed claim name {0:?} is reserved")]
    ReservedClaimName(String),
    #[error("disclosed claim {0} collides with an existing claim")]
    ClaimCollision(String),
    #[error("digest {0} is referenced more than once")]
    DuplicateDigest(String),
    #[error("{0} disclosures are not referenced by any digest")]
    UnconsumedDisclosures(usize),
    #[error("claims path {0} does not address any claim in the token")]
    UnknownClaimPath(String),
    #[error("issuer JWK is not a P-256 key: {0}")]
    Jwk(String),
    #[error("issuer signature does not verify")]
    InvalidSignature,
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

/// A parsed compact SD-JWT: `issuer-JWT ~ disclosure_1 ~ ... ~ [kb-JWT]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdJwt {
    issuer_jwt: String,
    disclosures: Vec<String>,
    key_binding: Option<String>,
}

impl SdJwt {
    /// Splits a compact serialization on `~`. A trailing separator means no
    /// key-binding JWT; otherwise the final segment is one.
    pub fn parse(compact: &str) -> Result<Self, SdJwtError> {
        let mut segments = compact.split('~');
        let issuer_jwt = segments.next().unwrap_or_default();
        if issuer_jwt.is_empty() {
            return Err(SdJwtError::MissingIssuerJwt);
        }
        let rest: Vec<&str> = segments.collect();
        let (disclosures, key_binding) = match rest.split_last() {
            None => (&rest[..], None),
            Some((last, head)) if last.is_empty() => (head, None),
            Some((last, head)) => (head, Some((*last).to_string())),
        };
        Ok(Self {
            issuer_jwt: issuer_jwt.to_string(),
            disclosures: disclosures
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| (*s).to_string())
                .collect(),
            key_binding,
        })
    }

    pub fn issuer_jwt(&self) -> &str {
        &self.issuer_jwt
    }

    pub fn disclosures(&self) -> &[String] {
        &self.disclosures
    }

    pub fn key_binding(&self) -> Option<&str> {
        self.key_binding.as_deref()
    }

    /// Checks the issuer JWT signature against a P-256 public key in JWK
    /// form.
    pub fn verify_signature(&self, issuer_jwk: &str) -> Result<(), SdJwtError> {
        let (signing_input, signature) = self
            .issuer_jwt
            .rsplit_once('.')
            .ok_or(SdJwtError::MalformedJwt)?;
        let key = p256::PublicKey::from_jwk_str(issuer_jwk)
            .map_err(|e| SdJwtError::Jwk(e.to_string()))?;
        let raw = BASE64_URL_SAFE_NO_PAD.decode(signature)?;
        let signature =
            Signature::from_slice(&raw).map_err(|_| SdJwtError::InvalidSignature)?;
        VerifyingKey::from(key)
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| SdJwtError::InvalidSignature)
    }

    /// Validates the issuer JWT structurally and reconciles every digest
    /// with its disclosure, producing the reconstructed claim tree.
    pub fn verify(&self) -> Result<VerifiedSdJwt, SdJwtError> {
        let (header, mut payload) = decode_jwt(&self.issuer_jwt)?;

        let typ = header.get("typ").and_then(Json::as_str);
        if typ != Some(SD_JWT_TYP) {
            return Err(SdJwtError::UnexpectedType(typ.map(String::from)));
        }
        let alg = header.get("alg").and_then(Json::as_str);
        if alg != Some(ES256) {
            return Err(SdJwtError::UnsupportedAlgorithm(alg.map(String::from)));
        }

        for claim in ["iss", "iat", "cnf", "vct"] {
            if !payload.contains_key(claim) {
                return Err(SdJwtError::MissingClaim(claim));
            }
        }
        if let Some(alg) = payload.remove(SD_ALG_KEY) {
            if alg.as_str() != Some(SHA_256_ALG) {
                return Err(SdJwtError::UnsupportedSdAlg(alg));
            }
        }

        let mut by_digest = HashMap::with_capacity(self.disclosures.len());
        for encoded in &self.disclosures {
            let digest = digest_b64(encoded.as_bytes());
            let parsed = ParsedDisclosure::parse(encoded)?;
            if by_digest.insert(digest.clone(), parsed).is_some() {
                return Err(SdJwtError::DuplicateDigest(digest));
            }
        }

        let mut walker = Walker {
            disclosures: &by_digest,
            seen: HashSet::new(),
            map: SdMap::default(),
        };
        let (processed, _root) = walker.walk(&Json::Object(payload))?;

        let unconsumed = by_digest
            .keys()
            .filter(|digest| !walker.seen.contains(*digest))
            .count();
        if unconsumed > 0 {
            return Err(SdJwtError::UnconsumedDisclosures(unconsumed));
        }

        debug!(
            disclosures = self.disclosures.len(),
            "reconstructed sd-jwt claim tree"
        );
        Ok(VerifiedSdJwt {
            issuer_jwt: self.issuer_jwt.clone(),
            disclosures: self.disclosures.clone(),
            processed,
            sd_map: walker.map,
        })
    }
}

/// A structurally verified SD-JWT, ready for presentation.
#[derive(Debug, Clone)]
pub struct VerifiedSdJwt {
    issuer_jwt: String,
    disclosures: Vec<String>,
    processed: Json,
    sd_map: SdMap,
}

impl VerifiedSdJwt {
    /// The fully reconstructed claim tree, disclosures resolved and
    /// `_sd`/`_sd_alg` machinery stripped.
    pub fn claims(&self) -> &Json {
        &self.processed
    }

    pub fn vct(&self) -> Option<&str> {
        self.processed.get("vct").and_then(Json::as_str)
    }

    /// Builds a presentation: issuer JWT, the selected disclosures, and a
    /// key-binding JWT minted with the holder's key.
    ///
    /// `selected` of `None` discloses everything. Paths select the digests
    /// of every disclosable claim they pass through, plus all disclosable
    /// descendants when the addressed claim is a container that is not
    /// itself disclosable. A `null` segment fans out across array elements.
    pub fn present(
        &self,
        selected: Option<&[ClaimPath]>,
        nonce: &str,
        client_id: &str,
        holder_key: &dyn CredentialSigner,
    ) -> Result<String, SdJwtError> {
        let disclosed: Vec<&str> = match selected {
            None => self.disclosures.iter().map(String::as_str).collect(),
            Some(paths) => {
                let mut digests = Vec::new();
                for path in paths {
                    self.sd_map.select(path, &mut digests)?;
                }
                let digests: HashSet<&str> = digests.iter().map(String::as_str).collect();
                // Original disclosure order, duplicates collapsed.
                self.disclosures
                    .iter()
                    .filter(|d| digests.contains(digest_b64(d.as_bytes()).as_str()))
                    .map(String::as_str)
                    .collect()
            }
        };

        let mut token = self.issuer_jwt.clone();
        token.push('~');
        for disclosure in disclosed {
            token.push_str(disclosure);
            token.push('~');
        }
        // sd_hash covers the token up to and including the final separator.
        let sd_hash = digest_b64(token.as_bytes());
        let key_binding = key_binding_jwt(nonce, client_id, &sd_hash, holder_key)?;
        token.push_str(&key_binding);
        Ok(token)
    }
}

fn key_binding_jwt(
    nonce: &str,
    client_id: &str,
    sd_hash: &str,
    holder_key: &dyn CredentialSigner,
) -> Result<String, SdJwtError> {
    let header = json!({ "typ": KEY_BINDING_TYP, "alg": ES256 });
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let payload = json!({
        "iat": iat,
        "aud": client_id,
        "nonce": nonce,
        "sd_hash": sd_hash,
    });

    let mut jwt = String::new();
    jwt.push_str(&BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?));
    jwt.push('.');
    jwt.push_str(&BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?));
    let der = holder_key.sign(jwt.as_bytes())?;
    let raw = signature::der_to_raw(&der)?;
    jwt.push('.');
    jwt.push_str(&BASE64_URL_SAFE_NO_PAD.encode(raw));
    Ok(jwt)
}

/// base64url(SHA-256(data)), the digest form used throughout SD-JWT.
fn digest_b64(data: &[u8]) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(data))
}

/// Decoded header and payload of a compact JWS. The signature segment stays
/// opaque here; `verify_signature` consumes it.
fn decode_jwt(jwt: &str) -> Result<(Map<String, Json>, Map<String, Json>), SdJwtError> {
    let mut parts = jwt.split('.');
    let (Some(header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(SdJwtError::MalformedJwt);
    };
    let header = serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(header)?)?;
    let payload = serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(payload)?)?;
    Ok((header, payload))
}

/// One decoded disclosure.
struct ParsedDisclosure {
    encoded: String,
    kind: DisclosureKind,
}

enum DisclosureKind {
    /// `[salt, name, value]`, redeemed from an `_sd` array.
    Claim { name: String, value: Json },
    /// `[salt, value]`, redeemed from a `{"...": digest}` array marker.
    Element { value: Json },
}

impl ParsedDisclosure {
    fn parse(encoded: &str) -> Result<Self, SdJwtError> {
        let raw = BASE64_URL_SAFE_NO_PAD.decode(encoded)?;
        let array: Vec<Json> = serde_json::from_slice(&raw)?;
        let kind = match array.as_slice() {
            [_salt, Json::String(name), value] => DisclosureKind::Claim {
                name: name.clone(),
                value: value.clone(),
            },
            [_salt, value] => DisclosureKind::Element {
                value: value.clone(),
            },
            _ => return Err(SdJwtError::MalformedDisclosure(encoded.to_string())),
        };
        Ok(Self {
            encoded: encoded.to_string(),
            kind,
        })
    }
}

type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SdEdge {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Default)]
struct SdNode {
    digest: Option<String>,
    children: Vec<(SdEdge, NodeId)>,
}

/// Arena mirror of the reconstructed claim tree. Every node corresponds to
/// one value in the processed claims; disclosable nodes carry the digest
/// that stands in for them when their disclosure is withheld.
#[derive(Debug, Clone, Default)]
pub struct SdMap {
    nodes: Vec<SdNode>,
}

impl SdMap {
    const ROOT: NodeId = 0;

    fn push(&mut self) -> NodeId {
        self.nodes.push(SdNode::default());
        self.nodes.len() - 1
    }

    fn link(&mut self, parent: NodeId, edge: SdEdge, child: NodeId) {
        self.nodes[parent].children.push((edge, child));
    }

    fn set_digest(&mut self, node: NodeId, digest: String) {
        self.nodes[node].digest = Some(digest);
    }

    fn child_by_key(&self, node: NodeId, key: &str) -> Option<NodeId> {
        self.nodes[node].children.iter().find_map(|(edge, child)| match edge {
            SdEdge::Key(k) if k == key => Some(*child),
            _ => None,
        })
    }

    fn child_by_index(&self, node: NodeId, index: usize) -> Option<NodeId> {
        self.nodes[node].children.iter().find_map(|(edge, child)| match edge {
            SdEdge::Index(i) if *i == index => Some(*child),
            _ => None,
        })
    }

    /// Appends every digest one claims path selects.
    fn select(&self, path: &[ClaimPathSegment], out: &mut Vec<String>) -> Result<(), SdJwtError> {
        self.select_from(Self::ROOT, path, path, out)
    }

    fn select_from(
        &self,
        node: NodeId,
        full: &[ClaimPathSegment],
        remaining: &[ClaimPathSegment],
        out: &mut Vec<String>,
    ) -> Result<(), SdJwtError> {
        // A claim is only visible if every disclosable ancestor on its path
        // is disclosed too.
        if let Some(digest) = &self.nodes[node].digest {
            out.push(digest.clone());
        }
        let Some((segment, rest)) = remaining.split_first() else {
            if self.nodes[node].digest.is_none() {
                self.collect_descendants(node, out);
            }
            return Ok(());
        };
        match segment {
            ClaimPathSegment::String(key) => {
                let child = self
                    .child_by_key(node, key)
                    .ok_or_else(|| unknown_path(full))?;
                self.select_from(child, full, rest, out)
            }
            ClaimPathSegment::Integer(index) => {
                let child = self
                    .child_by_index(node, *index)
                    .ok_or_else(|| unknown_path(full))?;
                self.select_from(child, full, rest, out)
            }
            ClaimPathSegment::Null => {
                for (edge, child) in &self.nodes[node].children {
                    if matches!(edge, SdEdge::Index(_)) {
                        self.select_from(*child, full, rest, out)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn collect_descendants(&self, node: NodeId, out: &mut Vec<String>) {
        for (_, child) in &self.nodes[node].children {
            if let Some(digest) = &self.nodes[*child].digest {
                out.push(digest.clone());
            }
            self.collect_descendants(*child, out);
        }
    }
}

fn unknown_path(path: &[ClaimPathSegment]) -> SdJwtError {
    SdJwtError::UnknownClaimPath(serde_json::to_string(path).unwrap_or_default())
}

struct Walker<'a> {
    disclosures: &'a HashMap<String, ParsedDisclosure>,
    seen: HashSet<String>,
    map: SdMap,
}

impl<'a> Walker<'a> {
    /// Records a digest reference and looks up its disclosure. A digest with
    /// no disclosure is legal (the claim stays hidden); a digest referenced
    /// twice is not.
    fn redeem(&mut self, digest: &str) -> Result<Option<&'a ParsedDisclosure>, SdJwtError> {
        if !self.seen.insert(digest.to_string()) {
            return Err(SdJwtError::DuplicateDigest(digest.to_string()));
        }
        Ok(self.disclosures.get(digest))
    }

    fn walk(&mut self, value: &Json) -> Result<(Json, NodeId), SdJwtError> {
        let node = self.map.push();
        let processed = match value {
            Json::Object(entries) => {
                let mut out = Map::new();
                for (key, entry) in entries {
                    if key == SD_KEY {
                        continue;
                    }
                    let (child_value, child) = self.walk(entry)?;
                    self.map.link(node, SdEdge::Key(key.clone()), child);
                    out.insert(key.clone(), child_value);
                }
                if let Some(sd) = entries.get(SD_KEY) {
                    let digests = sd.as_array().ok_or(SdJwtError::MalformedSdArray)?;
                    for digest in digests {
                        let digest = digest.as_str().ok_or(SdJwtError::MalformedSdArray)?;
                        let Some(disclosure) = self.redeem(digest)? else {
                            debug!(digest, "digest has no disclosure, claim stays hidden");
                            continue;
                        };
                        let DisclosureKind::Claim { name, value } = &disclosure.kind else {
                            return Err(SdJwtError::MalformedDisclosure(
                                disclosure.encoded.clone(),
                            ));
                        };
                        if name == SD_KEY || name == ARRAY_MARKER_KEY {
                            return Err(SdJwtError::ReservedClaimName(name.clone()));
                        }
                        if out.contains_key(name) {
                            return Err(SdJwtError::ClaimCollision(name.clone()));
                        }
                        let (child_value, child) = self.walk(value)?;
                        self.map.set_digest(child, digest.to_string());
                        self.map.link(node, SdEdge::Key(name.clone()), child);
                        out.insert(name.clone(), child_value);
                    }
                }
                Json::Object(out)
            }
            Json::Array(items) => {
                let mut out = Vec::new();
                for item in items {
                    if let Some(digest) = array_marker(item) {
                        let Some(disclosure) = self.redeem(digest)? else {
                            // Undisclosed array element: dropped entirely.
                            continue;
                        };
                        let DisclosureKind::Element { value } = &disclosure.kind else {
                            return Err(SdJwtError::MalformedDisclosure(
                                disclosure.encoded.clone(),
                            ));
                        };
                        let (child_value, child) = self.walk(value)?;
                        self.map.set_digest(child, digest.to_string());
                        self.map.link(node, SdEdge::Index(out.len()), child);
                        out.push(child_value);
                    } else {
                        let (child_value, child) = self.walk(item)?;
                        self.map.link(node, SdEdge::Index(out.len()), child);
                        out.push(child_value);
                    }
                }
                Json::Array(out)
            }
            scalar => scalar.clone(),
        };
        Ok((processed, node))
    }
}

/// `{"...": "<digest>"}`, the marker standing in for an undisclosed array
/// element.
fn array_marker(value: &Json) -> Option<&str> {
    let entries = value.as_object()?;
    if entries.len() != 1 {
        return None;
    }
    entries.get(ARRAY_MARKER_KEY)?.as_str()
}
