//! Locating the native helper through its manifest.
//!
//! The control plane installs a small JSON manifest next to the browser
//! native-messaging hosts. Its only field we rely on is `path`, which points
//! at the helper binary the handshake runner spawns.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAME: &str = "com.aurafriday.shim.json";

/// The parsed manifest file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Manifest {
    /// Helper binary to spawn.
    pub path: PathBuf,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    /// Linux and every other unix.
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

const MAC_BROWSERS: [&str; 3] = ["Google/Chrome", "Chromium", "Microsoft Edge"];
const LINUX_BROWSERS: [&str; 3] = ["google-chrome", "chromium", "microsoft-edge"];

/// Ordered candidate manifest locations for `platform`.
///
/// `home` is the user's home directory; `local_app_data` is only consulted on
/// Windows.
pub fn candidate_paths_for(
    platform: Platform,
    home: Option<&Path>,
    local_app_data: Option<&Path>,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    match platform {
        Platform::Windows => {
            if let Some(local) = local_app_data {
                candidates.push(local.join("AuraFriday").join(MANIFEST_FILE_NAME));
            }
            if let Some(home) = home {
                candidates.push(
                    home.join("AppData")
                        .join("Local")
                        .join("AuraFriday")
                        .join(MANIFEST_FILE_NAME),
                );
            }
        }
        Platform::MacOs => {
            if let Some(home) = home {
                let support = home.join("Library").join("Application Support");
                for browser in MAC_BROWSERS {
                    candidates.push(
                        support
                            .join(browser)
                            .join("NativeMessagingHosts")
                            .join(MANIFEST_FILE_NAME),
                    );
                }
            }
        }
        Platform::Linux => {
            if let Some(home) = home {
                let config = home.join(".config");
                for browser in LINUX_BROWSERS {
                    candidates.push(
                        config
                            .join(browser)
                            .join("NativeMessagingHosts")
                            .join(MANIFEST_FILE_NAME),
                    );
                }
            }
        }
    }
    candidates
}

/// Candidate locations for the running platform.
pub fn candidate_paths() -> Vec<PathBuf> {
    let local_app_data = std::env::var_os("LOCALAPPDATA").map(PathBuf::from);
    candidate_paths_for(
        Platform::current(),
        dirs::home_dir().as_deref(),
        local_app_data.as_deref(),
    )
}

/// Returns the first candidate that exists on disk.
pub fn find_manifest(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.is_file()).cloned()
}

pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let bytes = std::fs::read(path).map_err(|source| Error::ManifestRead {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| Error::ManifestInvalid {
        path: path.to_owned(),
        source,
    })
}

/// Finds and loads the manifest.
///
/// `override_path`, when given, is checked before the platform locations.
/// `Ok(None)` means no manifest is installed, which is not an error.
pub fn discover(override_path: Option<&Path>) -> Result<Option<(PathBuf, Manifest)>> {
    let mut candidates = Vec::new();
    if let Some(path) = override_path {
        candidates.push(path.to_owned());
    }
    candidates.extend(candidate_paths());
    match find_manifest(&candidates) {
        Some(path) => {
            let manifest = load_manifest(&path)?;
            logwise::info_sync!(
                "Found manifest at {path}",
                path = logwise::privacy::LogIt(&path)
            );
            Ok(Some((path, manifest)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_candidates_are_ordered_by_browser() {
        let home = Path::new("/home/u");
        let candidates = candidate_paths_for(Platform::Linux, Some(home), None);
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/home/u/.config/google-chrome/NativeMessagingHosts/com.aurafriday.shim.json"),
                PathBuf::from("/home/u/.config/chromium/NativeMessagingHosts/com.aurafriday.shim.json"),
                PathBuf::from("/home/u/.config/microsoft-edge/NativeMessagingHosts/com.aurafriday.shim.json"),
            ]
        );
    }

    #[test]
    fn macos_candidates_live_under_application_support() {
        let candidates = candidate_paths_for(Platform::MacOs, Some(Path::new("/Users/u")), None);
        assert_eq!(candidates.len(), 3);
        assert!(candidates[0].starts_with("/Users/u/Library/Application Support/Google/Chrome"));
        assert!(candidates[2].starts_with("/Users/u/Library/Application Support/Microsoft Edge"));
    }

    #[test]
    fn windows_prefers_local_app_data() {
        let candidates = candidate_paths_for(
            Platform::Windows,
            Some(Path::new("/home/u")),
            Some(Path::new("/local")),
        );
        assert_eq!(candidates[0], Path::new("/local/AuraFriday").join(MANIFEST_FILE_NAME));
        assert_eq!(
            candidates[1],
            Path::new("/home/u/AppData/Local/AuraFriday").join(MANIFEST_FILE_NAME)
        );
    }

    #[test]
    fn no_home_means_no_candidates() {
        assert!(candidate_paths_for(Platform::Linux, None, None).is_empty());
    }

    #[test]
    fn first_existing_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let second = dir.path().join("second.json");
        let third = dir.path().join("third.json");
        std::fs::write(&second, r#"{"path": "/bin/helper"}"#).unwrap();
        std::fs::write(&third, r#"{"path": "/bin/other"}"#).unwrap();

        let found = find_manifest(&[missing, second.clone(), third]);
        assert_eq!(found, Some(second));
    }

    #[test]
    fn manifest_parses_path_and_tolerates_extra_fields() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(MANIFEST_FILE_NAME);
        std::fs::write(
            &file,
            r#"{"name": "com.aurafriday.shim", "path": "/opt/shim/helper", "type": "stdio", "allowed_origins": []}"#,
        )
        .unwrap();
        let manifest = load_manifest(&file).unwrap();
        assert_eq!(manifest.path, PathBuf::from("/opt/shim/helper"));
        assert_eq!(manifest.kind.as_deref(), Some("stdio"));
    }

    #[test]
    fn malformed_manifest_is_distinct_from_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(MANIFEST_FILE_NAME);
        std::fs::write(&file, "{not json").unwrap();
        assert!(matches!(load_manifest(&file), Err(Error::ManifestInvalid { .. })));
        assert!(matches!(
            load_manifest(&dir.path().join("absent.json")),
            Err(Error::ManifestRead { .. })
        ));
    }

    #[test]
    fn override_path_is_used_first() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.json");
        std::fs::write(&file, r#"{"path": "/opt/helper"}"#).unwrap();
        let (path, manifest) = discover(Some(&file)).unwrap().unwrap();
        assert_eq!(path, file);
        assert_eq!(manifest.path, PathBuf::from("/opt/helper"));
    }
}
