use anyhow::{Context, Result};
use semver::{BuildMetadata, Prerelease, Version, VersionReq};

/// The engine refuses to start against servers older than this.
pub(crate) const MIN_SUPPORTED: &str = ">=1.8.0";

/// Builtin NetworkPolicy objects exist from this version on.
pub(crate) const NETWORK_POLICY: &str = ">=1.7.0";

/// The policy status subresource is served from this version on; older
/// servers take whole-object updates.
pub(crate) const STATUS_SUBRESOURCE: &str = ">=1.11.0";

pub(crate) fn matches(requirement: &str, version: &Version) -> bool {
    VersionReq::parse(requirement)
        .expect("static version requirement")
        .matches(version)
}

/// Parses a server's `gitVersion`, tolerating vendor decorations such as
/// `v1.27.3-gke.100` or `v1.26.1+k3s1`.
pub(crate) fn parse_git_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    let mut version = Version::parse(trimmed)
        .with_context(|| format!("unparseable server version {:?}", raw))?;
    // Vendor suffixes would otherwise defeat requirement matching.
    version.pre = Prerelease::EMPTY;
    version.build = BuildMetadata::EMPTY;
    Ok(version)
}

pub(crate) async fn server_version(client: &kube::Client) -> Result<Version> {
    let info = client.apiserver_version().await?;
    parse_git_version(&info.git_version)
}
