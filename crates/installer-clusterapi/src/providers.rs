//! Provider binaries shipped inside a zip archive
//!
//! Each [`Provider`] names the archive entries that belong to it. Extraction
//! writes only those entries, and refuses any entry whose cleaned path would
//! land outside the destination directory.

use std::borrow::Cow;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::{Error, Result};

static EMBEDDED_PROVIDERS: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/providers.zip"));
static EMBEDDED_MANIFESTS: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/manifests.zip"));

/// A named set of archive entries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Provider {
    /// Provider name
    pub name: &'static str,
    /// Archive entry names belonging to this provider
    pub sources: &'static [&'static str],
}

impl Provider {
    /// Whether `entry` belongs to this provider
    pub fn contains(&self, entry: &str) -> bool {
        self.sources.contains(&entry)
    }
}

/// Core Cluster API controller
pub const CLUSTER_API: Provider = Provider {
    name: "cluster-api",
    sources: &["cluster-api"],
};
/// AWS infrastructure provider (CAPA)
pub const AWS: Provider = infra("aws", &["cluster-api-provider-aws"]);
/// Azure infrastructure provider (CAPZ)
pub const AZURE: Provider = infra("azure", &["cluster-api-provider-azure"]);
/// Azure Service Operator, companion of CAPZ
pub const AZURE_ASO: Provider = infra("azureaso", &["cluster-api-provider-azureaso"]);
/// GCP infrastructure provider (CAPG)
pub const GCP: Provider = infra("gcp", &["cluster-api-provider-gcp"]);
/// IBM Cloud infrastructure provider (CAPIBM), also used for PowerVS
pub const IBMCLOUD: Provider = infra("ibmcloud", &["cluster-api-provider-ibmcloud"]);
/// Nutanix infrastructure provider (CAPX)
pub const NUTANIX: Provider = infra("nutanix", &["cluster-api-provider-nutanix"]);
/// OpenStack infrastructure provider (CAPO)
pub const OPENSTACK: Provider = infra("openstack", &["cluster-api-provider-openstack"]);
/// vSphere infrastructure provider (CAPV)
pub const VSPHERE: Provider = infra("vsphere", &["cluster-api-provider-vsphere"]);
/// Binaries of the local control plane
pub const ENVTEST: Provider = Provider {
    name: "envtest",
    sources: &["kube-apiserver", "etcd"],
};

const fn infra(name: &'static str, sources: &'static [&'static str]) -> Provider {
    Provider { name, sources }
}

/// Every provider shipped with the installer
pub const ALL: &[Provider] = &[
    CLUSTER_API,
    AWS,
    AZURE,
    AZURE_ASO,
    GCP,
    IBMCLOUD,
    NUTANIX,
    OPENSTACK,
    VSPHERE,
    ENVTEST,
];

/// Look up a provider by name
pub fn by_name(name: &str) -> Option<Provider> {
    ALL.iter().copied().find(|p| p.name == name)
}

// =============================================================================
// Archive
// =============================================================================

#[derive(Clone, Debug)]
enum ArchiveBytes {
    Static(&'static [u8]),
    Shared(Arc<[u8]>),
}

impl AsRef<[u8]> for ArchiveBytes {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Static(b) => b,
            Self::Shared(b) => b,
        }
    }
}

/// A zip archive of provider binaries, parsed once
#[derive(Clone, Debug)]
pub struct ProviderArchive {
    zip: ZipArchive<Cursor<ArchiveBytes>>,
}

impl ProviderArchive {
    /// Provider binaries compiled into the installer
    pub fn embedded() -> Result<Self> {
        Self::parse(ArchiveBytes::Static(EMBEDDED_PROVIDERS))
    }

    /// Static Cluster API manifests compiled into the installer
    pub fn embedded_manifests() -> Result<Self> {
        Self::parse(ArchiveBytes::Static(EMBEDDED_MANIFESTS))
    }

    /// Archive from bytes already in memory
    pub fn from_bytes(bytes: impl Into<Cow<'static, [u8]>>) -> Result<Self> {
        match bytes.into() {
            Cow::Borrowed(b) => Self::parse(ArchiveBytes::Static(b)),
            Cow::Owned(v) => Self::parse(ArchiveBytes::Shared(v.into())),
        }
    }

    /// Archive from a reader without random access
    ///
    /// The whole stream is buffered in memory before parsing.
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .map_err(|e| Error::archive(format!("failed to read archive: {e}")))?;
        Self::from_bytes(buf)
    }

    /// Archive from a file on disk
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
        Self::from_bytes(bytes)
    }

    fn parse(bytes: ArchiveBytes) -> Result<Self> {
        let zip = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| Error::archive(format!("failed to open archive: {e}")))?;
        Ok(Self { zip })
    }

    /// Names of every entry in the archive
    pub fn entry_names(&self) -> Vec<String> {
        self.zip.file_names().map(str::to_string).collect()
    }

    /// Write the provider's entries into `dest`, creating it if needed
    ///
    /// Existing files are overwritten. Returns the paths written.
    pub fn extract(&self, provider: &Provider, dest: &Path) -> Result<Vec<PathBuf>> {
        info!(provider = provider.name, dest = %dest.display(), "extracting provider");
        self.extract_matching(dest, |name| provider.contains(name))
    }

    /// Write every entry into `dest`
    pub fn extract_all(&self, dest: &Path) -> Result<Vec<PathBuf>> {
        self.extract_matching(dest, |_| true)
    }

    fn extract_matching(&self, dest: &Path, wanted: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dest).map_err(|e| Error::io(dest, e))?;
        let mut zip = self.zip.clone();
        let mut written = Vec::new();

        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| Error::archive(format!("failed to read entry {i}: {e}")))?;
            let name = entry.name().to_string();
            if !wanted(&name) {
                continue;
            }

            let target = sanitize_entry_path(dest, &name)?;
            if entry.is_dir() {
                fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            write_entry(&mut entry, &target)?;
            #[cfg(unix)]
            set_mode(&target, entry.unix_mode())?;

            debug!(entry = %name, path = %target.display(), "extracted archive entry");
            written.push(target);
        }
        Ok(written)
    }
}

fn write_entry(entry: &mut impl Read, target: &Path) -> Result<()> {
    // remove first: overwriting a running binary in place fails with ETXTBSY
    if target.exists() {
        fs::remove_file(target).map_err(|e| Error::io(target, e))?;
    }
    let mut out = fs::File::create(target).map_err(|e| Error::io(target, e))?;
    std::io::copy(entry, &mut out).map_err(|e| Error::io(target, e))?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(target: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = match mode.map(|m| m & 0o7777) {
        Some(m) if m != 0 => m,
        _ => 0o755,
    };
    fs::set_permissions(target, fs::Permissions::from_mode(mode)).map_err(|e| Error::io(target, e))
}

/// Join `name` onto `dest`, rejecting names that escape it
fn sanitize_entry_path(dest: &Path, name: &str) -> Result<PathBuf> {
    let traversal = || Error::PathTraversal {
        entry: name.to_string(),
    };
    let mut cleaned = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    return Err(traversal());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(traversal()),
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Err(traversal());
    }

    let target = dest.join(cleaned);
    if !target.starts_with(dest) {
        return Err(traversal());
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn providers_are_unique_by_name() {
        let mut names: Vec<_> = ALL.iter().map(|p| p.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL.len());
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(by_name("vsphere"), Some(VSPHERE));
        assert!(ENVTEST.contains("etcd"));
        assert!(by_name("made-up").is_none());
    }

    #[test]
    fn sanitize_keeps_nested_paths_inside() {
        let dest = Path::new("/tmp/dest");
        assert_eq!(
            sanitize_entry_path(dest, "bin/./etcd").unwrap(),
            PathBuf::from("/tmp/dest/bin/etcd")
        );
        assert_eq!(
            sanitize_entry_path(dest, "bin/../etcd").unwrap(),
            PathBuf::from("/tmp/dest/etcd")
        );
    }

    #[test]
    fn sanitize_rejects_escapes() {
        let dest = Path::new("/tmp/dest");
        for name in ["../evil", "a/../../evil", "/etc/passwd", ".."] {
            assert!(
                matches!(
                    sanitize_entry_path(dest, name),
                    Err(Error::PathTraversal { .. })
                ),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn embedded_archive_parses() {
        assert!(ProviderArchive::embedded().is_ok());
        assert!(ProviderArchive::embedded_manifests().is_ok());
    }
}
