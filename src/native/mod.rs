//! Native APIs
//!
//! Built-in modules scripts reach through `require`. Each one holds a
//! [`HostContext`](crate::runtime::HostContext) and issues its blocking work
//! through the async module contract.
//!
//! | Name | Module |
//! |------|--------|
//! | `fs`, `node:fs` | [`FsModule`] |
//! | `http`, `node:http` | [`HttpModule`] |

pub mod fs;
pub mod http;

pub use fs::{DirEntry, FileInfo, FileSystem, FsModule};
pub use http::{Headers, HttpClient, HttpModule, Method, Request, Response, Url};

use crate::error::{Error, Result};
use crate::runtime::HostContext;

/// A loaded built-in module
#[derive(Debug, Clone)]
pub enum Builtin {
    Fs(FsModule),
    Http(HttpModule),
}

impl Builtin {
    /// Canonical name of a built-in, accepting the `node:` prefix
    pub fn canonical_name(name: &str) -> Option<&'static str> {
        match name.strip_prefix("node:").unwrap_or(name) {
            "fs" => Some("fs"),
            "http" => Some("http"),
            _ => None,
        }
    }

    pub(crate) fn load(name: &str, context: HostContext) -> Result<Self> {
        match Self::canonical_name(name) {
            Some("fs") => Ok(Self::Fs(FsModule::new(context))),
            Some("http") => Ok(Self::Http(HttpModule::new(context))),
            _ => Err(Error::ModuleNotFound(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Fs(_) => "fs",
            Self::Http(_) => "http",
        }
    }

    pub fn as_fs(&self) -> Option<&FsModule> {
        match self {
            Self::Fs(fs) => Some(fs),
            _ => None,
        }
    }

    pub fn as_http(&self) -> Option<&HttpModule> {
        match self {
            Self::Http(http) => Some(http),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_names() {
        assert_eq!(Builtin::canonical_name("fs"), Some("fs"));
        assert_eq!(Builtin::canonical_name("node:fs"), Some("fs"));
        assert_eq!(Builtin::canonical_name("node:http"), Some("http"));
        assert_eq!(Builtin::canonical_name("crypto"), None);
        assert_eq!(Builtin::canonical_name("node:"), None);
    }
}
