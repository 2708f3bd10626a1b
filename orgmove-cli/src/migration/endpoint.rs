//! Data endpoints a job reads from and writes to

use crate::api::OrgClient;

/// One side of a migration: a live org, or the flat files under the job
/// root's per-endpoint directories
#[derive(Debug)]
pub enum Endpoint {
    Org(OrgClient),
    Files,
}

impl Endpoint {
    pub fn is_files(&self) -> bool {
        matches!(self, Endpoint::Files)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Endpoint::Org(_) => "org",
            Endpoint::Files => "files",
        }
    }
}
