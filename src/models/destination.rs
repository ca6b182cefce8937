use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A target for copied data, embedded in a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destination {
    pub id: String,
    #[serde(flatten)]
    pub target: Target,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Target {
    Local { path: PathBuf },
    Network { path: PathBuf },
    Ftp(FtpTarget),
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FtpTarget {
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Remote directory uploads are rooted at.
    pub path: String,
    #[serde(default = "bool_true")]
    pub passive: bool,
}

const fn default_ftp_port() -> u16 {
    21
}
const fn bool_true() -> bool {
    true
}

// Keep the password out of log output.
impl fmt::Debug for FtpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("path", &self.path)
            .field("passive", &self.passive)
            .finish_non_exhaustive()
    }
}

impl Destination {
    pub fn local(id: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            target: Target::Local { path: path.into() },
        }
    }

    pub fn network(id: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            target: Target::Network { path: path.into() },
        }
    }

    pub fn ftp(id: &str, target: FtpTarget) -> Self {
        Self {
            id: id.to_string(),
            target: Target::Ftp(target),
        }
    }

    /// Human readable label used in logs and run records.
    pub fn label(&self) -> String {
        match &self.target {
            Target::Local { path } => format!("local:{}", path.display()),
            Target::Network { path } => format!("network:{}", path.display()),
            Target::Ftp(ftp) => format!(
                "ftp://{}@{}:{}{}",
                ftp.username, ftp.host, ftp.port, ftp.path
            ),
        }
    }

    /// True for destinations written through the local filesystem.
    pub fn is_filesystem(&self) -> bool {
        matches!(self.target, Target::Local { .. } | Target::Network { .. })
    }
}
