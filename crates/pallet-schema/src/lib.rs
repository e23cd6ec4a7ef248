//! Manifest parsing, validation, checksums, and version derivation for Pallet.
//!
//! This crate defines the schema layer: TOML manifest parsing into a validated,
//! immutable [`Manifest`], its inverse [`serialize_manifest`], the tagged
//! [`Checksum`] type pinning an archive's digest, install [`Destination`]
//! categories, and the URL-based version derivation used when a manifest
//! does not declare an explicit version.

pub mod checksum;
pub mod destination;
pub mod manifest;
pub mod types;
pub mod validate;
pub mod version;

pub use checksum::{Checksum, ChecksumError, DigestAlgorithm};
pub use destination::Destination;
pub use manifest::{
    parse_manifest_file, parse_manifest_str, serialize_manifest, InstallStep, Manifest,
    ManifestError, RawManifest, Source, TestStep, MANIFEST_VERSION,
};
pub use types::{PackageName, Version};
pub use validate::validate_package_name;
pub use version::derive_version;
