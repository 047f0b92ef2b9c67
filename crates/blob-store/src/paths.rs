//! Remote object naming.
//!
//! Every backup of volume `V` under backup name `B` produces objects below
//! `[<pathPrefix>/]backups/<B>/`, named `<prefix>-<V>-<B>` plus sidecar
//! suffixes for the claim and volume specs.

/// Claim spec sidecar suffix.
pub const PVC_SUFFIX: &str = ".pvc";

const BACKUP_DIR: &str = "backups";

/// Deterministic remote naming for one configured connection.
#[derive(Debug, Clone)]
pub struct RemoteLayout {
    /// File-name prefix (the `prefix` config option).
    file_prefix: String,
    /// Directory prefix (the `backupPathPrefix` config option).
    path_prefix: Option<String>,
}

impl RemoteLayout {
    pub fn new(file_prefix: impl Into<String>, path_prefix: Option<String>) -> Self {
        RemoteLayout {
            file_prefix: file_prefix.into(),
            path_prefix: path_prefix.filter(|p| !p.is_empty()),
        }
    }

    /// Key of the snapshot bytes object for `volume` under `backup`.
    pub fn file_name(&self, volume: &str, backup: &str) -> String {
        self.prefixed(format!(
            "{}/{}/{}-{}-{}",
            BACKUP_DIR, backup, self.file_prefix, volume, backup
        ))
    }

    /// Key of a sidecar object (`.pvc`, `.pv`, `.cvc`) next to the bytes.
    pub fn sidecar_name(&self, volume: &str, backup: &str, suffix: &str) -> String {
        format!("{}{}", self.file_name(volume, backup), suffix)
    }

    /// Listing prefix under which every backup directory lives.
    pub fn backups_root(&self) -> String {
        self.prefixed(format!("{}/", BACKUP_DIR))
    }

    fn prefixed(&self, rest: String) -> String {
        match &self.path_prefix {
            Some(prefix) => format!("{}/{}", prefix, rest),
            None => rest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_object_layout() {
        let layout = RemoteLayout::new("p", None);
        assert_eq!(layout.file_name("pv-1", "b1"), "backups/b1/p-pv-1-b1");
    }

    #[test]
    fn sidecar_layout() {
        let layout = RemoteLayout::new("p", None);
        assert_eq!(
            layout.sidecar_name("pv-1", "b1", PVC_SUFFIX),
            "backups/b1/p-pv-1-b1.pvc"
        );
    }

    #[test]
    fn path_prefix_is_prepended() {
        let layout = RemoteLayout::new("p", Some("cluster-a".to_string()));
        assert_eq!(
            layout.file_name("pv-1", "b1"),
            "cluster-a/backups/b1/p-pv-1-b1"
        );
        assert_eq!(layout.backups_root(), "cluster-a/backups/");
    }

    #[test]
    fn empty_path_prefix_is_ignored() {
        let layout = RemoteLayout::new("p", Some(String::new()));
        assert_eq!(layout.backups_root(), "backups/");
    }
}
