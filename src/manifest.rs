//! Manifests: opaque bytes, plus the parsed capability view the switch
//! needs. Decoded with `serde_json`, matching the JSON encoding convention
//! documented for RELAY_NOTIFY payloads.

use serde::{Deserialize, Serialize};

use crate::cap_urn::{cap_identity, CapUrn};
use crate::error::ManifestError;

/// A single advertised capability entry in the structured manifest form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cap {
    pub urn: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StructuredManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    caps: Vec<Cap>,
}

/// The legacy flat form: `{"capabilities": [urnString, ...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyManifest {
    capabilities: Vec<String>,
}

/// Parsed view of a manifest's metadata, when present in the structured
/// form. `None` for manifests using the legacy flat form.
#[derive(Debug, Clone, Default)]
pub struct ManifestMeta {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
}

/// Opaque bytes plus the parsed capability list the switch needs.
#[derive(Debug, Clone)]
pub struct Manifest {
    bytes: Vec<u8>,
}

impl Manifest {
    pub fn from_bytes(bytes: Vec<u8>) -> Manifest {
        Manifest { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Parsed, deduplicated-by-canonical-string capability list. Entries
    /// that fail to parse as a CapUrn are silently skipped — the manifest
    /// is produced by a peer we don't control, and a single malformed
    /// entry shouldn't take down the whole manifest.
    pub fn capabilities(&self) -> Vec<CapUrn> {
        let raw_urns: Vec<String> = if let Ok(structured) =
            serde_json::from_slice::<StructuredManifest>(&self.bytes)
        {
            if !structured.caps.is_empty() {
                structured.caps.into_iter().map(|c| c.urn).collect()
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };

        let raw_urns = if raw_urns.is_empty() {
            if let Ok(legacy) = serde_json::from_slice::<LegacyManifest>(&self.bytes) {
                legacy.capabilities
            } else {
                raw_urns
            }
        } else {
            raw_urns
        };

        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for urn in raw_urns {
            if let Ok(parsed) = CapUrn::parse(&urn) {
                let canon = parsed.canonical_string();
                if seen.insert(canon) {
                    result.push(parsed);
                }
            }
        }
        result
    }

    /// Metadata from the structured form, if present.
    pub fn meta(&self) -> ManifestMeta {
        match serde_json::from_slice::<StructuredManifest>(&self.bytes) {
            Ok(m) => ManifestMeta {
                name: m.name,
                version: m.version,
                description: m.description,
            },
            Err(_) => ManifestMeta::default(),
        }
    }

    /// Succeeds iff CAP_IDENTITY is present in the capability list.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let identity = cap_identity();
        let present = self
            .capabilities()
            .iter()
            .any(|c| c.canonical_string() == identity.canonical_string());
        if present {
            Ok(())
        } else {
            Err(ManifestError::MissingIdentity)
        }
    }

    /// Returns a manifest with CAP_IDENTITY present, without mutating
    /// `self`. Idempotent: calling this on an already-identity-bearing
    /// manifest adds nothing.
    pub fn ensure_identity(&self) -> Manifest {
        if self.validate().is_ok() {
            return self.clone();
        }

        let identity_urn = cap_identity().canonical_string();
        match serde_json::from_slice::<StructuredManifest>(&self.bytes) {
            Ok(mut structured) => {
                structured.caps.push(Cap {
                    urn: identity_urn,
                    title: Some("identity".to_string()),
                    command: None,
                });
                let bytes = serde_json::to_vec(&structured)
                    .expect("StructuredManifest always serializes");
                Manifest::from_bytes(bytes)
            }
            Err(_) => match serde_json::from_slice::<LegacyManifest>(&self.bytes) {
                Ok(mut legacy) => {
                    legacy.capabilities.push(identity_urn);
                    let bytes =
                        serde_json::to_vec(&legacy).expect("LegacyManifest always serializes");
                    Manifest::from_bytes(bytes)
                }
                Err(_) => {
                    // Unparseable manifest bytes: fall back to the
                    // canonical legacy form carrying just the identity cap.
                    let legacy = LegacyManifest {
                        capabilities: vec![identity_urn],
                    };
                    Manifest::from_bytes(
                        serde_json::to_vec(&legacy).expect("LegacyManifest always serializes"),
                    )
                }
            },
        }
    }
}
