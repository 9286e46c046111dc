//! Server binary layout and resolution order.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::ProvisioningConfig;

/// Which of the known binary locations was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryKind {
    Native,
    AlternateNative,
    /// Foreign-platform binary, needs the compatibility shim
    Foreign,
}

/// A runnable server binary inside an install directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBinary {
    pub kind: BinaryKind,
    pub path: PathBuf,
}

impl ResolvedBinary {
    /// Program and leading arguments needed to run this binary.
    ///
    /// Foreign binaries run as `<shim...> <binary>`; an empty shim runs the
    /// binary directly.
    pub fn invocation(&self, compat_shim: &[String]) -> (String, Vec<String>) {
        let binary = self.path.to_string_lossy().into_owned();
        match (self.kind, compat_shim.split_first()) {
            (BinaryKind::Foreign, Some((program, rest))) => {
                let mut args = rest.to_vec();
                args.push(binary);
                (program.clone(), args)
            }
            _ => (binary, Vec::new()),
        }
    }

    pub fn needs_compat_layer(&self) -> bool {
        self.kind == BinaryKind::Foreign
    }
}

/// Relative locations of the three binary variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryLayout {
    pub native: PathBuf,
    pub alternate: PathBuf,
    pub foreign: PathBuf,
}

impl BinaryLayout {
    pub fn from_config(config: &ProvisioningConfig) -> Self {
        Self {
            native: config.native_binary.clone(),
            alternate: config.alternate_binary.clone(),
            foreign: config.foreign_binary.clone(),
        }
    }

    /// Candidates in resolution order.
    ///
    /// `prefer_foreign` moves the foreign binary to the front.
    pub fn candidates(&self, prefer_foreign: bool) -> Vec<(BinaryKind, &Path)> {
        let mut order = vec![
            (BinaryKind::Native, self.native.as_path()),
            (BinaryKind::AlternateNative, self.alternate.as_path()),
            (BinaryKind::Foreign, self.foreign.as_path()),
        ];
        if prefer_foreign {
            order.rotate_right(1);
        }
        order
    }

    /// First candidate that exists as a file under `install_dir`.
    pub fn resolve(&self, install_dir: &Path, prefer_foreign: bool) -> Option<ResolvedBinary> {
        self.candidates(prefer_foreign)
            .into_iter()
            .map(|(kind, relative)| (kind, install_dir.join(relative)))
            .find(|(_, path)| path.is_file())
            .map(|(kind, path)| ResolvedBinary { kind, path })
    }
}

impl Default for BinaryLayout {
    fn default() -> Self {
        Self::from_config(&ProvisioningConfig::default())
    }
}
