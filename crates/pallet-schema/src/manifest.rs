use crate::checksum::{Checksum, ChecksumError, DigestAlgorithm};
use crate::destination::Destination;
use crate::types::{PackageName, Version};
use crate::validate::{validate_package_name, validate_rename, validate_source_path};
use crate::version::derive_version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// The only manifest format version this crate understands.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to serialize manifest: {0}")]
    SerializeToml(#[from] toml::ser::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("name must not be empty")]
    EmptyName,
    #[error("invalid package name '{0}': expected 1-64 characters of [a-z0-9._+-]")]
    InvalidName(String),
    #[error("source.url must not be empty")]
    MissingSourceUrl,
    #[error("source.url '{0}' must be an http(s):// or file:// URL or an absolute path")]
    UnsupportedUrl(String),
    #[error("source.checksum must not be empty")]
    MissingChecksum,
    #[error("invalid source.checksum: {0}")]
    Checksum(#[from] ChecksumError),
    #[error("source.checksum and source.sha256 disagree")]
    ConflictingChecksums,
    #[error("manifest installs nothing: the install list is empty")]
    NoInstallSteps,
    #[error("install step {index}: source path '{path}' must be relative and stay inside the archive")]
    UnsafeSourcePath { index: usize, path: String },
    #[error("install step {index}: rename '{rename}' must be a plain file name")]
    InvalidRename { index: usize, rename: String },
    #[error("test step {0}: command must not be empty")]
    EmptyTestCommand(usize),
    #[error("cannot derive a version from '{0}'; set source.version explicitly")]
    UndeterminedVersion(String),
}

/// Manifest exactly as written on disk, before validation.
///
/// Every field is defaulted so that missing values surface as specific
/// [`ManifestError`]s instead of generic TOML errors. Unknown fields are
/// ignored so that newer manifests still load.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawManifest {
    #[serde(default = "default_manifest_version")]
    pub manifest_version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub source: RawSource,
    #[serde(default)]
    pub install: Vec<RawInstallStep>,
    #[serde(default)]
    pub test: Vec<TestStep>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSource {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub checksum: String,
    /// Formula-style shorthand for `checksum = "sha256:<hex>"`.
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawInstallStep {
    pub source: String,
    pub destination: Destination,
    #[serde(default)]
    pub rename: Option<String>,
}

/// A validated, immutable package manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    manifest_version: u32,
    name: PackageName,
    description: String,
    homepage: String,
    source: Source,
    install: Vec<InstallStep>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    test: Vec<TestStep>,
    #[serde(skip)]
    resolved_version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    pub checksum: Checksum,
}

/// Place the archive entry `source` into the `destination` category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallStep {
    pub source: String,
    pub destination: Destination,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rename: Option<String>,
}

/// A smoke-test command: program followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStep {
    pub command: Vec<String>,
}

fn default_manifest_version() -> u32 {
    MANIFEST_VERSION
}

fn is_supported_url(url: &str) -> bool {
    url.starts_with("https://")
        || url.starts_with("http://")
        || url.starts_with("file://")
        || url.starts_with('/')
}

impl RawManifest {
    /// Validate into a [`Manifest`], resolving the effective version.
    pub fn validate(self) -> Result<Manifest, ManifestError> {
        if self.manifest_version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }

        let name = self.name.trim().to_owned();
        validate_package_name(&name)?;

        let url = self.source.url.trim().to_owned();
        if url.is_empty() {
            return Err(ManifestError::MissingSourceUrl);
        }
        if !is_supported_url(&url) {
            return Err(ManifestError::UnsupportedUrl(url));
        }

        let checksum = resolve_checksum(&self.source.checksum, self.source.sha256.as_deref())?;

        if self.install.is_empty() {
            return Err(ManifestError::NoInstallSteps);
        }
        let mut install = Vec::with_capacity(self.install.len());
        for (index, step) in self.install.into_iter().enumerate() {
            let source = step.source.trim().to_owned();
            validate_source_path(index, &source)?;
            if let Some(ref rename) = step.rename {
                validate_rename(index, rename)?;
            }
            install.push(InstallStep {
                source,
                destination: step.destination,
                rename: step.rename,
            });
        }

        for (index, step) in self.test.iter().enumerate() {
            if !step.command.first().is_some_and(|p| !p.trim().is_empty()) {
                return Err(ManifestError::EmptyTestCommand(index));
            }
        }

        let explicit = self
            .source
            .version
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .map(Version::new);
        let resolved_version = match explicit {
            Some(ref v) => v.clone(),
            None => derive_version(&url, &name)
                .map(Version::new)
                .ok_or_else(|| ManifestError::UndeterminedVersion(url.clone()))?,
        };

        Ok(Manifest {
            manifest_version: self.manifest_version,
            name: PackageName::new(name),
            description: self.description,
            homepage: self.homepage,
            source: Source {
                url,
                version: explicit,
                checksum,
            },
            install,
            test: self.test,
            resolved_version,
        })
    }
}

fn resolve_checksum(tagged: &str, sha256: Option<&str>) -> Result<Checksum, ManifestError> {
    let tagged = tagged.trim();
    let shorthand = sha256
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|hex| Checksum::new(DigestAlgorithm::Sha256, hex))
        .transpose()?;

    match (tagged.is_empty(), shorthand) {
        (true, None) => Err(ManifestError::MissingChecksum),
        (true, Some(c)) => Ok(c),
        (false, None) => Ok(tagged.parse()?),
        (false, Some(c)) => {
            let parsed: Checksum = tagged.parse()?;
            if parsed == c {
                Ok(parsed)
            } else {
                Err(ManifestError::ConflictingChecksums)
            }
        }
    }
}

impl Manifest {
    pub fn name(&self) -> &PackageName {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn homepage(&self) -> &str {
        &self.homepage
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn url(&self) -> &str {
        &self.source.url
    }

    pub fn checksum(&self) -> &Checksum {
        &self.source.checksum
    }

    /// Effective version: explicit `source.version`, else derived from the URL.
    pub fn version(&self) -> &Version {
        &self.resolved_version
    }

    pub fn install_steps(&self) -> &[InstallStep] {
        &self.install
    }

    pub fn test_steps(&self) -> &[TestStep] {
        &self.test
    }

    pub fn to_toml(&self) -> Result<String, ManifestError> {
        serialize_manifest(self)
    }
}

impl TestStep {
    pub fn program(&self) -> &str {
        self.command.first().map_or("", String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or(&[])
    }

    pub fn display(&self) -> String {
        self.command.join(" ")
    }
}

pub fn parse_manifest_str(input: &str) -> Result<Manifest, ManifestError> {
    let raw: RawManifest = toml::from_str(input)?;
    raw.validate()
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<Manifest, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}

pub fn serialize_manifest(manifest: &Manifest) -> Result<String, ManifestError> {
    Ok(toml::to_string(manifest)?)
}
