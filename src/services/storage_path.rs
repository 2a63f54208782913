//! Canonical object keys for maintenance attachments.
//!
//! Every object lives at
//! `maintenance/{owner_id}/{vehicle_id}/{maintenance_id}/{name}.{ext}`, with the
//! `{maintenance_id}` segment omitted for files staged before their record
//! exists. Public URLs are `{base_url}/storage/v1/object/public/{path}`.
//!
//! `StoragePath` is the only place that encodes or decodes this layout; the
//! store, the ledger and the coordinator all go through it.

use mime_guess::Mime;
use serde::{Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// First segment of every attachment key.
pub const ROOT_SEGMENT: &str = "maintenance";

/// Fixed marker separating the public base URL from the object path.
pub const PUBLIC_URL_MARKER: &str = "/storage/v1/object/public/";

const MAX_STEM_LEN: usize = 128;
const MAX_EXTENSION_LEN: usize = 10;

/// A parsed, validated attachment key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoragePath {
    owner_id: Uuid,
    vehicle_id: Uuid,
    maintenance_id: Option<Uuid>,
    file_name: String,
}

impl StoragePath {
    /// Build a fresh key with a random file name for an upload of `mime_type`.
    pub fn generate(
        owner_id: Uuid,
        vehicle_id: Uuid,
        maintenance_id: Option<Uuid>,
        mime_type: &str,
    ) -> Self {
        let extension = extension_for_mime(mime_type);
        Self {
            owner_id,
            vehicle_id,
            maintenance_id,
            file_name: format!("{}.{}", Uuid::new_v4().simple(), extension),
        }
    }

    /// Parse a raw key such as `maintenance/{owner}/{vehicle}/{name}.jpg`.
    ///
    /// Returns `None` for anything that does not follow the canonical layout,
    /// including keys with traversal segments or unparseable ids.
    pub fn parse(raw: &str) -> Option<Self> {
        let segments: Vec<&str> = raw.split('/').collect();
        let (owner, vehicle, maintenance, name) = match segments.as_slice() {
            [root, owner, vehicle, name] if *root == ROOT_SEGMENT => (owner, vehicle, None, name),
            [root, owner, vehicle, maintenance, name] if *root == ROOT_SEGMENT => {
                (owner, vehicle, Some(maintenance), name)
            }
            _ => return None,
        };

        let maintenance_id = match maintenance {
            Some(segment) => Some(Uuid::parse_str(segment).ok()?),
            None => None,
        };

        if !is_valid_file_name(name) {
            return None;
        }

        Some(Self {
            owner_id: Uuid::parse_str(owner).ok()?,
            vehicle_id: Uuid::parse_str(vehicle).ok()?,
            maintenance_id,
            file_name: (*name).to_string(),
        })
    }

    /// Derive the key from a public URL, stripping everything up to and
    /// including [`PUBLIC_URL_MARKER`]. Query strings and fragments are ignored.
    pub fn from_url(url: &str) -> Option<Self> {
        let start = url.find(PUBLIC_URL_MARKER)? + PUBLIC_URL_MARKER.len();
        let rest = &url[start..];
        let end = rest.find(['?', '#']).unwrap_or(rest.len());
        Self::parse(&rest[..end])
    }

    /// Public URL for this key under `base_url`.
    pub fn to_url(&self, base_url: &str) -> String {
        format!(
            "{}{}{}",
            base_url.trim_end_matches('/'),
            PUBLIC_URL_MARKER,
            self
        )
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn vehicle_id(&self) -> Uuid {
        self.vehicle_id
    }

    pub fn maintenance_id(&self) -> Option<Uuid> {
        self.maintenance_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Best guess at the content type from the extension.
    pub fn content_type(&self) -> Mime {
        mime_guess::from_path(&self.file_name).first_or_octet_stream()
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", ROOT_SEGMENT, self.owner_id, self.vehicle_id)?;
        if let Some(maintenance_id) = self.maintenance_id {
            write!(f, "/{}", maintenance_id)?;
        }
        write!(f, "/{}", self.file_name)
    }
}

impl Serialize for StoragePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// File extension used for uploads of `mime_type`, or `bin` when the type is
/// unknown. Only extensions that map back to the same type are picked, so the
/// download is served with the content type it was uploaded with.
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let Some(candidates) = mime_guess::get_mime_extensions_str(&essence) else {
        return "bin";
    };
    let subtype = essence.rsplit('/').next().unwrap_or_default();
    let round_trips = |ext: &&&'static str| {
        ext.len() <= MAX_EXTENSION_LEN
            && ext.bytes().all(|b| b.is_ascii_alphanumeric())
            && mime_guess::from_ext(ext).first_raw() == Some(essence.as_str())
    };

    candidates
        .iter()
        .filter(&round_trips)
        .find(|ext| **ext == subtype)
        .or_else(|| candidates.iter().find(&round_trips))
        .copied()
        .unwrap_or("bin")
}

/// `{stem}.{ext}` where the stem is `[A-Za-z0-9_-]+` and the extension is
/// alphanumeric. Rejects dot-only and hidden names.
fn is_valid_file_name(name: &str) -> bool {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    !stem.is_empty()
        && stem.len() <= MAX_STEM_LEN
        && stem
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        && !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.bytes().all(|b| b.is_ascii_alphanumeric())
}
